//! Bounded per-task output capture with spill-to-file.
//!
//! Each running task gets one capture with a byte budget shared by both
//! streams.  Under budget, chunks accumulate in memory; once the budget
//! is crossed, further chunks append to per-stream spill files keyed by
//! task id, and reads reconstruct memory + file in order.  Writes never
//! propagate an error back to the supervisor: if the spill sink fails
//! the capture degrades to dropping new output and records a
//! `truncated` marker instead of applying backpressure to the pipe.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use overseer_store::{OutputStream, TaskOutput};
use tracing::{debug, warn};

#[derive(Default)]
struct StreamBuf {
    /// In-memory prefix of the stream.
    mem: String,
    /// Open spill sink once the budget is crossed.
    spill: Option<File>,
}

struct CaptureState {
    stdout: StreamBuf,
    stderr: StreamBuf,
    /// Accepted bytes across both streams.
    total_bytes: u64,
    /// At least one chunk went to a spill file.
    spilled: bool,
    /// The spill sink failed; new output is being dropped.
    truncated: bool,
}

/// One task's output capture.
pub struct OutputCapture {
    task_id: String,
    budget: u64,
    spill_dir: PathBuf,
    state: Mutex<CaptureState>,
}

impl OutputCapture {
    pub fn new(task_id: impl Into<String>, budget: u64, spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_id: task_id.into(),
            budget,
            spill_dir: spill_dir.into(),
            state: Mutex::new(CaptureState {
                stdout: StreamBuf::default(),
                stderr: StreamBuf::default(),
                total_bytes: 0,
                spilled: false,
                truncated: false,
            }),
        }
    }

    /// Accept one chunk.  Infallible by contract; failures downgrade the
    /// capture instead of surfacing to the reader task.
    pub fn append(&self, stream: OutputStream, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.truncated {
            return;
        }

        let fits = !state.spilled && state.total_bytes + chunk.len() as u64 <= self.budget;
        if fits {
            let buf = match stream {
                OutputStream::Stdout => &mut state.stdout,
                OutputStream::Stderr => &mut state.stderr,
            };
            buf.mem.push_str(chunk);
            state.total_bytes += chunk.len() as u64;
            return;
        }

        // Over budget: append to the spill file for this stream.
        if !state.spilled {
            debug!(task_id = %self.task_id, budget = self.budget, "output budget crossed, spilling to file");
            state.spilled = true;
        }
        let spill_path = self.spill_path(stream);
        let buf = match stream {
            OutputStream::Stdout => &mut state.stdout,
            OutputStream::Stderr => &mut state.stderr,
        };
        if buf.spill.is_none() {
            match open_spill(&spill_path) {
                Ok(file) => buf.spill = Some(file),
                Err(err) => {
                    warn!(task_id = %self.task_id, path = %spill_path.display(), %err,
                          "spill sink unavailable, dropping further output");
                    state.truncated = true;
                    return;
                }
            }
        }
        if let Some(file) = buf.spill.as_mut() {
            if let Err(err) = file.write_all(chunk.as_bytes()) {
                warn!(task_id = %self.task_id, %err, "spill write failed, dropping further output");
                state.truncated = true;
                return;
            }
        }
        state.total_bytes += chunk.len() as u64;
    }

    /// Reconstruct the full captured output: memory plus spill files,
    /// split into lines (trailing partial line preserved).
    pub fn snapshot(&self) -> TaskOutput {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let stdout = self.stream_text(&state.stdout, OutputStream::Stdout);
        let stderr = self.stream_text(&state.stderr, OutputStream::Stderr);
        TaskOutput {
            stdout: split_lines(&stdout),
            stderr: split_lines(&stderr),
            total_size: state.total_bytes,
            truncated: state.truncated,
        }
    }

    /// Whether the capture has degraded to dropping output.
    pub fn is_truncated(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .truncated
    }

    /// Delete spill files (after the output has been persisted).
    pub fn cleanup(&self) {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let path = self.spill_path(stream);
            if path.exists() {
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), %err, "failed to remove spill file");
                }
            }
        }
    }

    fn stream_text(&self, buf: &StreamBuf, stream: OutputStream) -> String {
        let mut text = buf.mem.clone();
        if buf.spill.is_some() {
            match std::fs::read_to_string(self.spill_path(stream)) {
                Ok(spilled) => text.push_str(&spilled),
                Err(err) => {
                    warn!(task_id = %self.task_id, %err, "failed to read spill file back")
                }
            }
        }
        text
    }

    fn spill_path(&self, stream: OutputStream) -> PathBuf {
        let suffix = match stream {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        };
        self.spill_dir.join(format!("{}.{suffix}.log", self.task_id))
    }
}

fn open_spill(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Split captured text on `\n`, preserving a trailing partial line and
/// interior empty lines, dropping only the artifact after a final
/// newline.
fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines.into_iter().map(str::to_string).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
