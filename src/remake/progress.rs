use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Instant, Sleep};

use crate::makecmd::{BuildTask, TaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: bool,
    pub progressing: bool,
}

/// Tracks whether a starting build is making progress. The stall deadline is
/// pushed back by the grace period every time the pending count moves.
pub struct ProgressChecker {
    grace: Duration,
    pub(crate) stalled: Pin<Box<Sleep>>,
    remaining: Option<usize>,
}

impl ProgressChecker {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            stalled: Box::pin(sleep(grace)),
            remaining: None,
        }
    }

    pub async fn check(&mut self, task: &mut BuildTask) -> Result<Progress, TaskError> {
        let remaining = task.sample_progress().await?;
        let done = remaining == 0;
        let progressing = self.remaining != Some(remaining);
        self.remaining = Some(remaining);
        if progressing && !done {
            self.extend();
        }
        Ok(Progress { done, progressing })
    }

    fn extend(&mut self) {
        self.stalled.as_mut().reset(Instant::now() + self.grace);
    }
}
