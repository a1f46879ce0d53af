//! Status synchronization: one bulk status query per refresh, a time-limited cache of its
//! parsed results and a registry of tracked jobs that receive the reported states.
//!
//! The cache and the registry live behind a single async mutex that is held for a whole
//! refresh-and-reconcile pass. Concurrent refreshes are therefore serialized and a lookup always
//! observes one complete generation of the cache.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::backend::{BackendAdapter, StatusEntry, StatusScope};
use crate::common::config::{JobManagerOptions, UnknownSubmittedPolicy};
use crate::execution::Executor;
use crate::job::JobRef;
use crate::job::result::JobInfo;
use crate::job::state::JobState;
use crate::{Map, Set};

#[derive(Default)]
struct SyncState {
    entries: Map<String, StatusEntry>,
    /// `None` until the first successful refresh.
    refreshed_at: Option<Instant>,
    listeners: Map<String, Vec<JobRef>>,
    /// Number of successive refreshes that reported the job in an unrecognized state.
    unknown_reports: Map<String, u32>,
}

impl SyncState {
    fn register(&mut self, job: &JobRef) {
        let Some(id) = job.id().and_then(|id| id.as_backend().map(|id| id.to_string())) else {
            return;
        };
        if job.state().is_terminal() {
            return;
        }
        let jobs = self.listeners.entry(id).or_default();
        if !jobs.iter().any(|tracked| Arc::ptr_eq(tracked, job)) {
            jobs.push(job.clone());
        }
    }
}

pub(crate) struct StatusSynchronizer {
    adapter: Arc<dyn BackendAdapter>,
    executor: Arc<dyn Executor>,
    options: SyncOptions,
    state: Mutex<SyncState>,
    /// Number of finished refresh attempts (successful or not).
    refresh_count: AtomicU64,
}

struct SyncOptions {
    cache_ttl: Duration,
    track_only_started_jobs: bool,
    user_filter: Option<String>,
    max_scoped_query_ids: usize,
    unknown_submitted_policy: UnknownSubmittedPolicy,
}

impl StatusSynchronizer {
    pub fn new(
        adapter: Arc<dyn BackendAdapter>,
        executor: Arc<dyn Executor>,
        options: &JobManagerOptions,
    ) -> Self {
        Self {
            adapter,
            executor,
            options: SyncOptions {
                cache_ttl: options.status_cache_ttl,
                track_only_started_jobs: options.track_only_started_jobs,
                user_filter: options.user_filter.clone(),
                max_scoped_query_ids: options.max_scoped_query_ids,
                unknown_submitted_policy: options.unknown_submitted_policy,
            },
            state: Mutex::new(SyncState::default()),
            refresh_count: AtomicU64::new(0),
        }
    }

    /// Registers a submitted job for status updates.
    /// Jobs without a backend identifier and jobs in a terminal state are ignored.
    pub async fn track(&self, job: &JobRef) {
        self.state.lock().await.register(job);
    }

    /// Stops status updates of the given backend identifiers.
    pub async fn untrack(&self, ids: &[String]) {
        let mut state = self.state.lock().await;
        for id in ids {
            state.listeners.remove(id);
            state.unknown_reports.remove(id);
        }
    }

    pub async fn tracked_job_count(&self) -> usize {
        self.state.lock().await.listeners.values().map(|jobs| jobs.len()).sum()
    }

    /// Returns metadata of a job from the last status report, if there is any.
    pub async fn cached_info(&self, id: &str) -> Option<JobInfo> {
        self.state
            .lock()
            .await
            .entries
            .get(id)
            .map(|entry| entry.info.clone())
    }

    /// Was the job present in the last status report?
    pub async fn is_reported(&self, job: &JobRef) -> bool {
        let Some(id) = job.id() else {
            return false;
        };
        let Some(id) = id.as_backend() else {
            return false;
        };
        self.state.lock().await.entries.contains_key(id)
    }

    /// Registers `jobs` (see [`StatusSynchronizer::track`]) and brings all tracked jobs up to
    /// date.
    ///
    /// The backend is queried if `force` is set, if there was no successful refresh yet or if the
    /// cache is older than its time budget. A forced request that had to wait for another refresh
    /// to finish reuses its result instead of issuing a second query. Without a refresh, tracked
    /// jobs are reconciled against the cached entries.
    pub async fn synchronize(&self, jobs: &[JobRef], force: bool) {
        let observed_refreshes = self.refresh_count.load(Ordering::SeqCst);
        let mut state = self.state.lock().await;
        for job in jobs {
            state.register(job);
        }
        let refreshed_meanwhile = self.refresh_count.load(Ordering::SeqCst) != observed_refreshes;
        let stale = state
            .refreshed_at
            .is_none_or(|at| at.elapsed() >= self.options.cache_ttl);
        if (force && !refreshed_meanwhile) || (!force && stale) {
            self.refresh(&mut state).await;
        }
        self.reconcile(&mut state);
    }

    async fn refresh(&self, state: &mut SyncState) {
        if state.listeners.is_empty() {
            log::trace!("No tracked jobs, skipping status refresh");
            return;
        }
        match self.query(state).await {
            Ok(mut entries) => {
                if self.options.track_only_started_jobs {
                    entries.retain(|id, _| state.listeners.contains_key(id));
                }
                let SyncState {
                    listeners,
                    unknown_reports,
                    ..
                } = &mut *state;
                unknown_reports.retain(|id, _| listeners.contains_key(id));
                for id in listeners.keys() {
                    match entries.get(id) {
                        Some(entry) if entry.state == JobState::UnknownSubmitted => {
                            *unknown_reports.entry(id.clone()).or_default() += 1;
                        }
                        _ => {
                            unknown_reports.remove(id);
                        }
                    }
                }
                log::debug!("Status refresh reported {} job(s)", entries.len());
                state.entries = entries;
                state.refreshed_at = Some(Instant::now());
            }
            Err(error) => {
                log::warn!("Job status refresh failed, keeping cached status: {error:?}");
            }
        }
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn query(&self, state: &SyncState) -> anyhow::Result<Map<String, StatusEntry>> {
        let scope = if state.listeners.len() <= self.options.max_scoped_query_ids {
            let mut ids: Vec<String> = state.listeners.keys().cloned().collect();
            ids.sort_unstable();
            StatusScope::Jobs(ids)
        } else {
            StatusScope::All {
                user: self.options.user_filter.clone(),
            }
        };
        let command = self.adapter.build_status_command(&scope)?;
        log::debug!("Querying job status with `{}`", command.command_line());
        let result = self.executor.execute(&command).await;
        log::trace!("Status output:\n{}", result.output());
        if !result.successful {
            anyhow::bail!(
                "`{}` exited with code {}\n{}",
                command.program,
                result.exit_code,
                result.output()
            );
        }
        self.adapter.parse_status_output(&result.result_lines)
    }

    fn reconcile(&self, state: &mut SyncState) {
        let SyncState {
            entries,
            listeners,
            unknown_reports,
            ..
        } = state;
        let mut resolved = Set::default();
        listeners.retain(|id, jobs| {
            jobs.retain(|job| !job.state().is_terminal());
            if jobs.is_empty() {
                return false;
            }
            let Some(entry) = entries.get(id) else {
                return true;
            };
            if entry.state == JobState::UnknownSubmitted {
                let reports = unknown_reports.get(id).copied().unwrap_or(0);
                if self.tolerates_unknown(reports) {
                    return true;
                }
                log::debug!("Job {id} reported in an unrecognized state, marking it as failed");
                for job in jobs.iter() {
                    job.apply_reported_state(JobState::Failed, None);
                }
                resolved.insert(id.clone());
                return false;
            }
            let info = (!entry.state.is_planned_or_running()).then_some(&entry.info);
            for job in jobs.iter() {
                job.apply_reported_state(entry.state, info);
            }
            jobs.retain(|job| !job.state().is_terminal());
            !jobs.is_empty()
        });
        for id in resolved {
            unknown_reports.remove(&id);
        }
    }

    fn tolerates_unknown(&self, reports: u32) -> bool {
        match self.options.unknown_submitted_policy {
            UnknownSubmittedPolicy::Fail => false,
            UnknownSubmittedPolicy::GracePolls(polls) => reports <= polls,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::StatusSynchronizer;
    use crate::backend::BackendType;
    use crate::common::config::{JobManagerOptions, UnknownSubmittedPolicy};
    use crate::execution::{ExecutionResult, Executor};
    use crate::job::JobContext;
    use crate::job::state::JobState;
    use crate::tests::utils::{MockExecutor, pbs_job, qstat_output, script_job, submitted};

    fn synchronizer(
        executor: &Arc<MockExecutor>,
        options: JobManagerOptions,
    ) -> StatusSynchronizer {
        StatusSynchronizer::new(
            crate::create_adapter(BackendType::Pbs),
            executor.clone() as Arc<dyn Executor>,
            &options,
        )
    }

    #[tokio::test]
    async fn skip_query_without_tracked_jobs() {
        let executor = MockExecutor::new(|_| qstat_output([]));
        let sync = synchronizer(&executor, JobManagerOptions::default());
        sync.synchronize(&[], true).await;
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn reuse_cache_within_time_budget() {
        let executor = MockExecutor::new(|_| qstat_output([("5", pbs_job("R"))]));
        let sync = synchronizer(&executor, JobManagerOptions::default());
        let ctx = JobContext::new();
        let job = submitted(script_job(&ctx, "a", vec![]), "5", JobState::Queued);
        sync.track(&job).await;

        sync.synchronize(&[], false).await;
        sync.synchronize(&[], false).await;
        assert_eq!(executor.call_count(), 1);
        assert_eq!(job.state(), JobState::Running);

        sync.synchronize(&[], true).await;
        assert_eq!(executor.call_count(), 2);
    }

    #[tokio::test]
    async fn refresh_expired_cache() {
        let executor = MockExecutor::new(|_| qstat_output([("5", pbs_job("Q"))]));
        let sync = synchronizer(
            &executor,
            JobManagerOptions {
                status_cache_ttl: Duration::ZERO,
                ..Default::default()
            },
        );
        let ctx = JobContext::new();
        let job = submitted(script_job(&ctx, "a", vec![]), "5", JobState::Hold);
        sync.track(&job).await;

        sync.synchronize(&[], false).await;
        sync.synchronize(&[], false).await;
        assert_eq!(executor.call_count(), 2);
        assert_eq!(job.state(), JobState::Queued);
    }

    #[tokio::test]
    async fn concurrent_forced_refreshes_share_one_query() {
        let executor = MockExecutor::new(|_| qstat_output([("5", pbs_job("R"))]))
            .with_delay(Duration::from_millis(50));
        let sync = synchronizer(&executor, JobManagerOptions::default());
        let ctx = JobContext::new();
        let job = submitted(script_job(&ctx, "a", vec![]), "5", JobState::Queued);
        sync.track(&job).await;

        futures::join!(sync.synchronize(&[], true), sync.synchronize(&[], true));
        assert_eq!(executor.call_count(), 1);
        assert_eq!(job.state(), JobState::Running);
    }

    #[tokio::test]
    async fn keep_terminal_state() {
        let executor = MockExecutor::new(|_| qstat_output([("5", pbs_job("R"))]));
        let sync = synchronizer(&executor, JobManagerOptions::default());
        let ctx = JobContext::new();
        let job = submitted(script_job(&ctx, "a", vec![]), "5", JobState::Queued);
        sync.track(&job).await;
        job.set_state(JobState::Aborted);

        sync.synchronize(&[], true).await;
        assert_eq!(job.state(), JobState::Aborted);
        assert_eq!(sync.tracked_job_count().await, 0);
    }

    #[tokio::test]
    async fn missing_entry_keeps_state() {
        let executor = MockExecutor::new(|_| qstat_output([("7", pbs_job("R"))]));
        let sync = synchronizer(&executor, JobManagerOptions::default());
        let ctx = JobContext::new();
        let job = submitted(script_job(&ctx, "a", vec![]), "5", JobState::Hold);
        sync.track(&job).await;

        sync.synchronize(&[], true).await;
        assert_eq!(job.state(), JobState::Hold);
        assert_eq!(sync.tracked_job_count().await, 1);
        // Entries of jobs that are not tracked are not cached
        assert_eq!(sync.cached_info("7").await, None);
    }

    #[tokio::test]
    async fn keep_stale_cache_on_failure() {
        let executor = MockExecutor::new(|_| qstat_output([("5", pbs_job("R"))]));
        let sync = synchronizer(&executor, JobManagerOptions::default());
        let ctx = JobContext::new();
        let job = submitted(script_job(&ctx, "a", vec![]), "5", JobState::Queued);
        sync.track(&job).await;
        sync.synchronize(&[], true).await;
        assert_eq!(job.state(), JobState::Running);

        executor.set_handler(|_| ExecutionResult::failure(255, vec!["connection lost".into()]));
        sync.synchronize(&[], true).await;
        assert_eq!(executor.call_count(), 2);
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(sync.cached_info("5").await.unwrap().user.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn unknown_state_fails_job() {
        let executor = MockExecutor::new(|_| qstat_output([("5", pbs_job("Z"))]));
        let sync = synchronizer(&executor, JobManagerOptions::default());
        let ctx = JobContext::new();
        let job = submitted(script_job(&ctx, "a", vec![]), "5", JobState::Queued);
        sync.track(&job).await;

        sync.synchronize(&[], true).await;
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(sync.tracked_job_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_state_grace_polls() {
        let executor = MockExecutor::new(|_| qstat_output([("5", pbs_job("Z"))]));
        let sync = synchronizer(
            &executor,
            JobManagerOptions {
                unknown_submitted_policy: UnknownSubmittedPolicy::GracePolls(1),
                ..Default::default()
            },
        );
        let ctx = JobContext::new();
        let job = submitted(script_job(&ctx, "a", vec![]), "5", JobState::Queued);
        sync.track(&job).await;

        sync.synchronize(&[], true).await;
        // Reconciling against the same cache does not count as another report
        sync.synchronize(&[], false).await;
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(executor.call_count(), 1);

        sync.synchronize(&[], true).await;
        assert_eq!(job.state(), JobState::Failed);
    }

    fn finished_job(exit_status: i64) -> serde_json::Value {
        let mut job = pbs_job("F");
        job["Job_Name"] = "align".into();
        job["queue"] = "-".into();
        job["Exit_status"] = exit_status.into();
        job["resources_used"]["cput"] = "00:02:30".into();
        job
    }

    #[tokio::test]
    async fn finished_job_becomes_terminal() {
        let executor = MockExecutor::new(|_| qstat_output([("5", finished_job(0))]));
        let sync = synchronizer(&executor, JobManagerOptions::default());
        let ctx = JobContext::new();
        let job = submitted(script_job(&ctx, "a", vec![]), "5", JobState::Running);
        sync.track(&job).await;

        sync.synchronize(&[], true).await;
        assert_eq!(job.state(), JobState::CompletedSuccessful);
        let info = job.info().unwrap();
        assert_eq!(info.description.as_deref(), Some("align"));
        assert_eq!(info.user.as_deref(), Some("alice"));
        assert_eq!(info.cpu_time, Some(Duration::from_secs(150)));
        assert_eq!(info.exit_code, Some(0));
        assert_eq!(info.queue, None);
        assert_eq!(sync.tracked_job_count().await, 0);

        // Nothing is tracked anymore, so there is nothing to query
        sync.synchronize(&[], true).await;
        sync.synchronize(&[job.clone()], true).await;
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn non_zero_exit_status_fails_job() {
        let executor = MockExecutor::new(|_| qstat_output([("5", finished_job(1))]));
        let sync = synchronizer(&executor, JobManagerOptions::default());
        let ctx = JobContext::new();
        let job = submitted(script_job(&ctx, "a", vec![]), "5", JobState::Running);
        sync.track(&job).await;

        sync.synchronize(&[], true).await;
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.info().unwrap().exit_code, Some(1));
        assert_eq!(sync.tracked_job_count().await, 0);
    }

    #[tokio::test]
    async fn scope_query_by_tracked_ids() {
        let executor = MockExecutor::new(|_| qstat_output([]));
        let sync = synchronizer(
            &executor,
            JobManagerOptions {
                max_scoped_query_ids: 1,
                user_filter: Some("alice".to_string()),
                ..Default::default()
            },
        );
        let ctx = JobContext::new();
        let a = submitted(script_job(&ctx, "a", vec![]), "5", JobState::Queued);
        sync.track(&a).await;
        sync.synchronize(&[], true).await;

        let b = submitted(script_job(&ctx, "b", vec![]), "6", JobState::Queued);
        sync.track(&b).await;
        sync.synchronize(&[], true).await;

        let commands: Vec<String> = executor
            .commands()
            .iter()
            .map(|command| command.command_line())
            .collect();
        assert_eq!(
            commands,
            vec!["qstat -x -t -f -F json 5", "qstat -x -t -f -F json"]
        );
    }
}
