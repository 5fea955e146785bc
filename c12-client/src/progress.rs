//! Progress of long table transfers

use std::sync::Arc;

/// Receiver of transfer progress
///
/// Called from the task running the transfer, so implementations should
/// return quickly.
#[cfg_attr(test, mockall::automock)]
pub trait ProgressSink: Send + Sync {
    /// `percent` of the current table read, 0 ..= 100
    fn progress(&self, percent: u8);
}

/// Sink that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&self, _percent: u8) {}
}

/// Tracks bytes of a transfer with a known total
#[derive(Clone)]
pub(crate) struct ProgressTracker {
    sink: Option<Arc<dyn ProgressSink>>,
    total: usize,
    done: usize,
    last_percent: Option<u8>,
}

impl ProgressTracker {
    pub(crate) fn new(sink: Option<Arc<dyn ProgressSink>>, total: usize) -> Self {
        Self {
            sink,
            total,
            done: 0,
            last_percent: None,
        }
    }

    /// Report `received` bytes of the current chunk on top of finished ones
    pub(crate) fn report(&mut self, received: usize) {
        let Some(sink) = &self.sink else {
            return;
        };
        if self.total == 0 {
            return;
        }
        let percent = ((self.done + received).min(self.total) * 100 / self.total) as u8;
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            sink.progress(percent);
        }
    }

    pub(crate) fn finish_chunk(&mut self, size: usize) {
        self.done += size;
    }

    pub(crate) fn complete(&mut self) {
        if let Some(sink) = &self.sink {
            if self.last_percent != Some(100) {
                self.last_percent = Some(100);
                sink.progress(100);
            }
        }
    }
}
