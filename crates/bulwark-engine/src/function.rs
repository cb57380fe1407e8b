//! The capability contract every blueprint function implements
//!
//! Dispatch is purely by name through [`crate::FunctionRegistry`]; the
//! executor never inspects the concrete type behind a `dyn Function`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::args::{check_args, Args};
use crate::context::ExecContext;
use crate::output::Output;
use crate::param::TemplateParams;
use crate::Result;

/// Progress reported before a function starts
pub const PROGRESS_NOT_STARTED: &str = "0.00";
/// Progress reported once a function has started
pub const PROGRESS_STARTED: &str = "10.00";
/// Progress reported once a function has finished
pub const PROGRESS_COMPLETED: &str = "100.00";

/// Point-in-time progress of a function
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseProgress {
    /// Percent complete, two decimals (e.g. "10.00")
    pub percent: String,
    /// When the percentage last changed
    pub last_transition_time: DateTime<Utc>,
}

impl PhaseProgress {
    /// Progress at `percent`, stamped now
    pub fn now(percent: &str) -> Self {
        Self {
            percent: percent.to_string(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Started/completed progress tracking for functions without finer detail
#[derive(Debug)]
pub struct ProgressCell {
    inner: Mutex<PhaseProgress>,
}

impl Default for ProgressCell {
    fn default() -> Self {
        Self {
            inner: Mutex::new(PhaseProgress::now(PROGRESS_NOT_STARTED)),
        }
    }
}

impl ProgressCell {
    /// Mark the function started
    pub fn start(&self) {
        *self.inner.lock() = PhaseProgress::now(PROGRESS_STARTED);
    }

    /// Mark the function finished, successfully or not
    pub fn complete(&self) {
        *self.inner.lock() = PhaseProgress::now(PROGRESS_COMPLETED);
    }

    /// Current progress
    pub fn snapshot(&self) -> PhaseProgress {
        self.inner.lock().clone()
    }

    /// Run `work` between [`start`](Self::start) and [`complete`](Self::complete)
    pub async fn track<F, T>(&self, work: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.start();
        let result = work.await;
        self.complete();
        result
    }
}

/// A named unit of work a blueprint phase can invoke
#[async_trait]
pub trait Function: Send + Sync {
    /// Name blueprints use to invoke the function
    fn name(&self) -> &str;

    /// Arguments that must be present
    fn required_args(&self) -> &[&str];

    /// Every accepted argument, required ones included
    fn arguments(&self) -> &[&str];

    /// Check rendered arguments before execution
    ///
    /// Unknown arguments are rejected first, then missing required ones.
    fn validate(&self, args: &Args) -> Result<()> {
        check_args(self.name(), args, self.required_args(), self.arguments())
    }

    /// Do the work; must return promptly once `ctx` is cancelled
    async fn exec(&self, ctx: &ExecContext, params: &TemplateParams, args: &Args)
        -> Result<Output>;

    /// Progress snapshot for status reporting
    fn execution_progress(&self) -> Result<PhaseProgress> {
        Ok(PhaseProgress::now(PROGRESS_NOT_STARTED))
    }

    /// When true, arguments reach `exec` unrendered so the function can
    /// evaluate its own templates
    fn skip_arg_render(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn progress_cell_tracks_start_and_completion() {
        let cell = ProgressCell::default();
        assert_eq!(cell.snapshot().percent, PROGRESS_NOT_STARTED);

        let observed = cell
            .track(async { cell.snapshot().percent })
            .await;
        assert_eq!(observed, PROGRESS_STARTED);
        assert_eq!(cell.snapshot().percent, PROGRESS_COMPLETED);
    }
}
