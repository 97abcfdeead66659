//! Captured output of remote commands.
//!
//! Every node holds at most one [`CommandOutput`]. Lines are appended while
//! the remote process runs, so callers can inspect progress mid-flight
//! through a [`SharedOutput`] handle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Default number of lines retained per stream.
pub const DEFAULT_MAX_LINES: usize = 1000;

/// Bounded FIFO of text lines. Pushing into a full buffer drops the oldest
/// line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LineBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LineBuffer {
    /// Creates an empty buffer holding at most `capacity` lines.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_MAX_LINES)),
            capacity,
        }
    }

    /// Appends a line, evicting the oldest one when the buffer is full.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Number of retained lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns `true` when no line has been retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Maximum number of retained lines.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates over retained lines, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Most recently pushed line.
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }
}

/// Which captured stream(s) to render.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputStream {
    /// Standard output only.
    Stdout,
    /// Standard error only.
    Stderr,
    /// Standard output followed by standard error.
    Both,
}

/// Output of the most recent command run on a node.
#[derive(Clone, Debug)]
pub struct CommandOutput {
    command: String,
    stdout: LineBuffer,
    stderr: LineBuffer,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    started: Instant,
    finished: Option<Instant>,
}

impl CommandOutput {
    /// Starts tracking `command`, with each stream capped at `max_lines`.
    #[must_use]
    pub fn start(command: impl Into<String>, max_lines: usize) -> Self {
        Self {
            command: command.into(),
            stdout: LineBuffer::with_capacity(max_lines),
            stderr: LineBuffer::with_capacity(max_lines),
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            started: Instant::now(),
            finished: None,
        }
    }

    /// Records completion of the command.
    pub fn finish(&mut self, exit_code: Option<i32>) {
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
        self.finished = Some(Instant::now());
    }

    /// The command that produced this output.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Captured standard output.
    #[must_use]
    pub const fn stdout(&self) -> &LineBuffer {
        &self.stdout
    }

    /// Captured standard error.
    #[must_use]
    pub const fn stderr(&self) -> &LineBuffer {
        &self.stderr
    }

    /// Appends a standard output line.
    pub fn push_stdout(&mut self, line: impl Into<String>) {
        self.stdout.push(line);
    }

    /// Appends a standard error line.
    pub fn push_stderr(&mut self, line: impl Into<String>) {
        self.stderr.push(line);
    }

    /// Wall-clock start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wall-clock end time, `None` while running.
    #[must_use]
    pub const fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Exit status, `None` while running or when the process was killed by a
    /// signal.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Returns `true` until [`CommandOutput::finish`] is called.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.finished.is_none()
    }

    /// Returns `true` when the command finished with exit status zero.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    /// Time between start and finish, `None` while running.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.finished
            .map(|finished| finished.saturating_duration_since(self.started))
    }

    /// Time since start, up to the finish when there is one.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.elapsed().unwrap_or_else(|| self.started.elapsed())
    }

    /// Renders the selected stream(s) as newline-terminated text.
    #[must_use]
    pub fn render(&self, stream: OutputStream) -> String {
        let mut text = String::new();
        if matches!(stream, OutputStream::Stdout | OutputStream::Both) {
            for line in self.stdout.iter() {
                text.push_str(line);
                text.push('\n');
            }
        }
        if matches!(stream, OutputStream::Stderr | OutputStream::Both) {
            for line in self.stderr.iter() {
                text.push_str(line);
                text.push('\n');
            }
        }
        text
    }
}

/// Shared handle to a node's current [`CommandOutput`].
///
/// Fan-out tasks write through the handle while monitors read snapshots.
/// Locks are never held across an await point.
#[derive(Clone, Debug, Default)]
pub struct SharedOutput {
    inner: Arc<Mutex<Option<CommandOutput>>>,
}

impl SharedOutput {
    /// Creates an empty handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any previous output with a fresh one for `command`.
    pub fn begin(&self, command: &str, max_lines: usize) {
        *self.lock() = Some(CommandOutput::start(command, max_lines));
    }

    /// Appends a standard output line to the current output.
    pub fn push_stdout(&self, line: String) {
        if let Some(output) = self.lock().as_mut() {
            output.push_stdout(line);
        }
    }

    /// Appends a standard error line to the current output.
    pub fn push_stderr(&self, line: String) {
        if let Some(output) = self.lock().as_mut() {
            output.push_stderr(line);
        }
    }

    /// Marks the current output as finished.
    pub fn finish(&self, exit_code: Option<i32>) {
        if let Some(output) = self.lock().as_mut() {
            output.finish(exit_code);
        }
    }

    /// Clone of the current output.
    #[must_use]
    pub fn snapshot(&self) -> Option<CommandOutput> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<CommandOutput>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests;
