//! Orchestration primitives for the overseer daemon.
//!
//! This crate holds the pieces every other overseer crate builds on:
//!
//! - [`error`] — the closed error-kind taxonomy and the [`TaskError`]
//!   carried across subsystem boundaries.
//! - [`config`] — environment-driven daemon configuration.
//! - [`event`] / [`bus`] — typed events and the awaited pub/sub bus with
//!   request/response correlation.
//! - [`queue`] — the priority-ordered runnable set.
//! - [`monitor`] — CPU/memory sampling and the spawn-admission predicate.
//! - [`autoscaler`] — the control loop that adjusts the worker cap.

pub mod autoscaler;
pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod monitor;
pub mod queue;

pub use autoscaler::{Autoscaler, WorkerGauge};
pub use bus::{EventBus, EventHandler};
pub use config::Config;
pub use error::{ErrorKind, TaskError, TaskResult};
pub use event::{Event, EventKind, EventPayload, ResponseValue, TaskPriority, TaskStatus};
pub use monitor::{ResourceMetrics, ResourceMonitor};
pub use queue::PriorityQueue;
