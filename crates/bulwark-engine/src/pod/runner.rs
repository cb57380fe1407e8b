//! Start a pod, do work against it, always clean it up

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

use super::controller::PodController;
use crate::{Error, Result};

/// Stops a pod once the run finishes or the context is cancelled
///
/// The task is joined by [`PodRunner::run`], so a failed delete is reported
/// to the caller rather than lost. If the run future is dropped the guard
/// fires and the pod is still stopped.
pub struct CleanupTask {
    handle: JoinHandle<Result<()>>,
    finished: DropGuard,
}

impl CleanupTask {
    /// Spawn the watcher
    pub fn spawn(
        controller: Arc<dyn PodController>,
        cancel: CancellationToken,
        grace: Duration,
    ) -> Self {
        let finished = CancellationToken::new();
        let done = finished.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(pod = ?controller.pod_name(), "context cancelled, stopping pod");
                }
                _ = done.cancelled() => {}
            }
            controller.stop_pod(Some(grace)).await
        });
        Self {
            handle,
            finished: finished.drop_guard(),
        }
    }

    /// Signal that the work is done and wait for the pod to be stopped
    pub async fn join(self) -> Result<()> {
        drop(self.finished);
        self.handle
            .await
            .map_err(|e| Error::execution("pod cleanup task", e.to_string()))?
    }
}

/// Reusable start → ready → work → cleanup sequence
pub struct PodRunner {
    controller: Arc<dyn PodController>,
    grace: Duration,
}

impl PodRunner {
    /// Runner for the pod managed by `controller`
    pub fn new(controller: Arc<dyn PodController>, grace: Duration) -> Self {
        Self { controller, grace }
    }

    /// Start the pod, wait for it to be ready, then run `work`
    ///
    /// The pod is deleted afterwards whatever the outcome. Cancellation
    /// interrupts `work` and deletes the pod immediately.
    pub async fn run<F, Fut, T>(&self, cancel: &CancellationToken, work: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn PodController>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = self.controller.start_pod().await?;
        let namespace = self.controller.namespace();
        let cleanup = CleanupTask::spawn(self.controller.clone(), cancel.clone(), self.grace);

        let controller = self.controller.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                Err(Error::cancelled(format!("running pod {namespace}/{name}")))
            }
            result = async {
                controller.wait_for_pod_ready(cancel).await?;
                work(controller.clone()).await
            } => result,
        };

        match (result, cleanup.join().await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(Error::execution(
                format!("stop pod {namespace}/{name}"),
                e.to_string(),
            )),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup_err)) => {
                warn!(
                    namespace = %namespace,
                    pod = %name,
                    error = %cleanup_err,
                    "failed to stop pod"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::controller::MockPodController;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn started(mock: &mut MockPodController) {
        mock.expect_start_pod()
            .times(1)
            .returning(|| Ok("bulwark-job-abc".to_string()));
        mock.expect_namespace().returning(|| "shop".to_string());
        mock.expect_pod_name()
            .returning(|| Some("bulwark-job-abc".to_string()));
    }

    // =========================================================================
    // Story: Pods never outlive the function that created them
    // =========================================================================

    /// Story: Work succeeds; the pod is still deleted exactly once.
    #[tokio::test]
    async fn story_pod_is_deleted_after_successful_work() {
        let mut mock = MockPodController::new();
        started(&mut mock);
        mock.expect_wait_for_pod_ready().returning(|_| Ok(()));
        mock.expect_stop_pod()
            .withf(|grace| *grace == Some(Duration::from_secs(3)))
            .times(1)
            .returning(|_| Ok(()));

        let runner = PodRunner::new(Arc::new(mock), Duration::from_secs(3));
        let value = runner
            .run(&CancellationToken::new(), |_| async { Ok(42) })
            .await
            .expect("run should succeed");
        assert_eq!(value, 42);
    }

    /// Story: The pod never becomes ready; the work is skipped and the pod
    /// is deleted anyway.
    #[tokio::test]
    async fn story_unready_pod_is_cleaned_up() {
        let mut mock = MockPodController::new();
        started(&mut mock);
        mock.expect_wait_for_pod_ready()
            .returning(|_| {
                Err(Error::pod_not_ready("shop", "bulwark-job-abc", "ImagePullBackOff"))
            });
        mock.expect_stop_pod().times(1).returning(|_| Ok(()));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let runner = PodRunner::new(Arc::new(mock), Duration::from_secs(3));
        let err = runner
            .run(&CancellationToken::new(), |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .expect_err("unready pod should fail");
        assert!(matches!(err, Error::PodNotReady { .. }));
        assert!(!ran.load(Ordering::SeqCst));
    }

    /// Story: The action is cancelled mid-run; the work is interrupted and
    /// the pod deleted.
    #[tokio::test(start_paused = true)]
    async fn story_cancellation_stops_the_pod() {
        let mut mock = MockPodController::new();
        started(&mut mock);
        mock.expect_wait_for_pod_ready().returning(|_| Ok(()));
        mock.expect_stop_pod().times(1).returning(|_| Ok(()));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let runner = PodRunner::new(Arc::new(mock), Duration::from_secs(3));
        let err = runner
            .run(&cancel, |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await
            .expect_err("cancelled run should fail");
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn cleanup_failure_after_success_is_reported() {
        let mut mock = MockPodController::new();
        started(&mut mock);
        mock.expect_wait_for_pod_ready().returning(|_| Ok(()));
        mock.expect_stop_pod()
            .returning(|_| Err(Error::execution("delete pod", "forbidden")));

        let runner = PodRunner::new(Arc::new(mock), Duration::from_secs(3));
        let err = runner
            .run(&CancellationToken::new(), |_| async { Ok(()) })
            .await
            .expect_err("cleanup failure should surface");
        let msg = err.to_string();
        assert!(msg.contains("shop/bulwark-job-abc"));
        assert!(msg.contains("forbidden"));
    }

    #[tokio::test]
    async fn work_error_wins_over_cleanup_error() {
        let mut mock = MockPodController::new();
        started(&mut mock);
        mock.expect_wait_for_pod_ready().returning(|_| Ok(()));
        mock.expect_stop_pod()
            .returning(|_| Err(Error::execution("delete pod", "forbidden")));

        let runner = PodRunner::new(Arc::new(mock), Duration::from_secs(3));
        let err = runner
            .run(&CancellationToken::new(), |_| async {
                Err::<(), _>(Error::execution("pod shop/bulwark-job-abc", "exit code 1"))
            })
            .await
            .expect_err("work failure should surface");
        assert!(err.to_string().contains("exit code 1"));
    }
}
