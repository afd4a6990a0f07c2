//! Bounded fan-out of script tasks over one shared session.
//!
//! # Architecture
//!
//! A driver task walks the job list, acquires a pool permit for each job and
//! only then spawns its [`run_task`]. A saturated pool therefore holds back
//! further spawns instead of queueing unbounded work.
//!
//! Each task sends its [`TaskResult`] into an mpsc channel as soon as it
//! finishes, so the result sink sees fast scripts before slow ones. The
//! driver keeps its own sender until every spawned task has been joined; the
//! channel closing is the join barrier as seen by the consumer.
//!
//! # Result guarantee
//!
//! Exactly one result is produced per job: a task that panics is replaced
//! by a `TaskError::Aborted` result, and a job still waiting for a permit
//! when the run is cancelled gets a `Cancelled(transfer)` result without
//! touching the device.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::deadline::Interrupted;
use super::error::TaskError;
use super::session::RemoteSession;
use super::task::{TaskSettings, run_task};
use super::types::{ScriptJob, Stage, TaskResult};

/// A started dispatch.
pub struct Dispatch {
    /// One result per job, in completion order. Closes after the last one.
    pub results: mpsc::Receiver<TaskResult>,
    /// Resolves with the number of jobs once every task has been joined.
    pub handle: JoinHandle<usize>,
}

/// Runs script jobs on a bounded worker pool.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    settings: Arc<TaskSettings>,
    max_concurrency: usize,
}

impl Dispatcher {
    pub fn new(settings: TaskSettings, max_concurrency: usize) -> Self {
        Self {
            settings: Arc::new(settings),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Start running `jobs` against `session`.
    ///
    /// The session is only borrowed by the tasks; closing it after the
    /// returned handle resolves is up to the caller.
    pub fn spawn(
        &self,
        session: Arc<dyn RemoteSession>,
        jobs: Vec<ScriptJob>,
        cancel: CancellationToken,
    ) -> Dispatch {
        let (tx, results) = mpsc::channel(self.max_concurrency);
        let settings = self.settings.clone();
        let pool = Arc::new(Semaphore::new(self.max_concurrency));

        let handle = tokio::spawn(async move {
            let total = jobs.len();
            info!(
                "Dispatching {} script(s) to {} with up to {} in parallel",
                total,
                session.peer(),
                pool.available_permits()
            );

            let mut running = Vec::with_capacity(total);
            for job in jobs {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = pool.clone().acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    debug!("Script {} cancelled before it started", job.name());
                    send(&tx, cancelled_before_start(job)).await;
                    continue;
                };

                let task_session = session.clone();
                let task_settings = settings.clone();
                let task_cancel = cancel.clone();
                let task_tx = tx.clone();
                let task_job = job.clone();
                let spawned = tokio::spawn(async move {
                    let result =
                        run_task(task_session.as_ref(), task_job, &task_settings, &task_cancel)
                            .await;
                    drop(permit);
                    send(&task_tx, result).await;
                });
                running.push((job, spawned));
            }

            let (jobs, handles): (Vec<_>, Vec<_>) = running.into_iter().unzip();
            for (job, joined) in jobs.into_iter().zip(join_all(handles).await) {
                if let Err(e) = joined {
                    error!("Script task for {} aborted: {}", job.local_path.display(), e);
                    let mut result = TaskResult::new(job);
                    result.error = Some(TaskError::Aborted(e.to_string()));
                    send(&tx, result).await;
                }
            }

            debug!("All {} script task(s) on {} joined", total, session.peer());
            total
        });

        Dispatch { results, handle }
    }
}

fn cancelled_before_start(job: ScriptJob) -> TaskResult {
    let mut result = TaskResult::new(job);
    result.error = Some(TaskError::Interrupted {
        stage: Stage::Transfer,
        reason: Interrupted::Cancelled,
    });
    result
}

async fn send(tx: &mpsc::Sender<TaskResult>, result: TaskResult) {
    if tx.send(result).await.is_err() {
        debug!("Result receiver dropped; discarding task result");
    }
}

/// Drain a dispatch into a vector, in completion order.
pub async fn collect(mut results: mpsc::Receiver<TaskResult>) -> Vec<TaskResult> {
    let mut collected = Vec::new();
    while let Some(result) = results.recv().await {
        collected.push(result);
    }
    collected
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fleet::error::CommandError;
    use crate::fleet::testing::{MockReply, MockSession, Scratch};
    use crate::fleet::types::{CleanupOutcome, TaskState};

    fn dispatcher(max_concurrency: usize) -> Dispatcher {
        Dispatcher::new(
            TaskSettings {
                privileged_shell: "sudo bash".to_string(),
                remove_command: "sudo rm -f".to_string(),
                script_timeout: Duration::from_secs(30),
                cleanup_timeout: Duration::from_secs(5),
            },
            max_concurrency,
        )
    }

    fn jobs(scratch: &Scratch, names: &[&str]) -> Vec<ScriptJob> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| ScriptJob::new(i, scratch.file(name, "true\n"), "/tmp"))
            .collect()
    }

    #[tokio::test]
    async fn test_one_result_per_job_despite_failures() {
        let session = MockSession::new();
        let scratch = Scratch::new();
        session.script("a.sh", MockReply::ok("ok-a"));
        session.script("b.sh", MockReply::exit(1, "", "no"));
        let mut all = jobs(&scratch, &["a.sh", "b.sh", "c.sh"]);
        all.push(ScriptJob::new(3, "/nonexistent/d.sh", "/tmp"));

        let dispatch = dispatcher(4).spawn(session.clone(), all, CancellationToken::new());
        let results = collect(dispatch.results).await;

        assert_eq!(dispatch.handle.await.unwrap(), 4);
        assert_eq!(results.len(), 4);
        let by_name = |n: &str| results.iter().find(|r| r.job.name() == n).unwrap();
        assert!(by_name("a.sh").is_success());
        assert!(by_name("c.sh").is_success());
        assert_eq!(
            by_name("b.sh").error,
            Some(TaskError::Execute(CommandError::ExitStatus(1)))
        );
        assert_eq!(by_name("d.sh").state(), TaskState::Failed(Stage::Transfer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounds_concurrency() {
        let session = MockSession::new();
        let scratch = Scratch::new();
        session.reply_when("sudo bash ", "", MockReply::ok("").after(Duration::from_secs(1)));
        let names: Vec<String> = (0..6).map(|i| format!("s{}.sh", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();

        let dispatch = dispatcher(2).spawn(session.clone(), jobs(&scratch, &refs), CancellationToken::new());
        let results = collect(dispatch.results).await;

        assert_eq!(results.len(), 6);
        assert!(session.peak_concurrency() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_result_not_held_back_by_slow_one() {
        let session = MockSession::new();
        let scratch = Scratch::new();
        session.script("slow.sh", MockReply::ok("slow").after(Duration::from_secs(20)));
        session.script("fast.sh", MockReply::ok("fast"));

        let mut dispatch = dispatcher(2).spawn(
            session.clone(),
            jobs(&scratch, &["slow.sh", "fast.sh"]),
            CancellationToken::new(),
        );

        let first = dispatch.results.recv().await.unwrap();
        assert_eq!(first.job.name(), "fast.sh");
        let second = dispatch.results.recv().await.unwrap();
        assert_eq!(second.job.name(), "slow.sh");
        assert!(dispatch.results.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reaches_running_and_queued_tasks() {
        let session = MockSession::new();
        let scratch = Scratch::new();
        session.reply_when("sudo bash ", "", MockReply::hang());
        let cancel = CancellationToken::new();

        let dispatch = dispatcher(1).spawn(
            session.clone(),
            jobs(&scratch, &["a.sh", "b.sh", "c.sh"]),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let results = collect(dispatch.results).await;

        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|r| matches!(r.state(), TaskState::Cancelled(_))));
        // Only the task that had started touched the device, and it was cleaned up
        let started: Vec<_> = results
            .iter()
            .filter(|r| r.cleanup != CleanupOutcome::Skipped)
            .collect();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].cleanup, CleanupOutcome::Removed);
        assert!(session.files().is_empty());
    }

    #[test]
    fn test_zero_concurrency_clamped() {
        assert_eq!(dispatcher(0).max_concurrency(), 1);
    }
}
