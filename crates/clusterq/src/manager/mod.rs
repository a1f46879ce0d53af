//! The job manager submits jobs through one backend adapter and keeps them up to date.
mod command;
mod poller;
mod sync;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::backend::BackendAdapter;
use crate::common::config::JobManagerOptions;
use crate::common::error::{ClusterqError, configuration_error};
use crate::execution::{ExecutionResult, Executor};
use crate::job::JobRef;
use crate::job::id::{FakeReason, JobId, unique_backend_ids};
use crate::job::result::{JobInfo, JobResult};
use crate::job::state::JobState;
use crate::manager::command::{Dependencies, build_submit_command, resolve_dependencies};
use crate::manager::poller::Poller;
use crate::manager::sync::StatusSynchronizer;

/// Number of successive status refreshes that may miss a job before waiting for it gives up.
const MISSING_REPORT_LIMIT: u32 = 3;

pub struct JobManager {
    adapter: Arc<dyn BackendAdapter>,
    executor: Arc<dyn Executor>,
    options: JobManagerOptions,
    synchronizer: Arc<StatusSynchronizer>,
    poller: Mutex<Option<Poller>>,
}

impl JobManager {
    pub fn new(
        adapter: Arc<dyn BackendAdapter>,
        executor: Arc<dyn Executor>,
        options: JobManagerOptions,
    ) -> Self {
        let synchronizer = Arc::new(StatusSynchronizer::new(
            adapter.clone(),
            executor.clone(),
            &options,
        ));
        Self {
            adapter,
            executor,
            options,
            synchronizer,
            poller: Mutex::new(None),
        }
    }

    pub fn adapter(&self) -> &dyn BackendAdapter {
        self.adapter.as_ref()
    }

    /// Are jobs submitted in a held state?
    pub fn holds_jobs(&self) -> bool {
        self.options
            .hold_jobs
            .unwrap_or_else(|| self.adapter.hold_jobs_by_default())
    }

    /// Submits a job to the backend.
    ///
    /// Performs exactly one submission attempt. Failures of the backend are reported through the
    /// returned [`JobResult`] and the state of the job, an error is only returned for jobs that
    /// cannot be submitted at all (sentinel jobs, jobs that were already submitted).
    pub async fn run_job(&self, job: &JobRef) -> crate::Result<JobResult> {
        if job.is_fake() {
            return configuration_error(format!("Job {} is a sentinel job", job.name()));
        }
        if let Some(id) = job.id() {
            return configuration_error(format!(
                "Job {} was already submitted as {id}",
                job.name()
            ));
        }
        let hold = self.holds_jobs();
        let parents: Vec<JobId> = job.parents().iter().filter_map(|parent| parent.id()).collect();

        let dependencies = match resolve_dependencies(job, self.adapter.dependency_mode()) {
            Dependencies::Ready(dependencies) => dependencies,
            Dependencies::Blocked { parent } => {
                log::info!(
                    "Job {} was not executed, its parent {parent} did not finish successfully",
                    job.name()
                );
                let mut command = build_submit_command(self.adapter.as_ref(), job, &[], hold)?;
                let id = JobId::Fake(FakeReason::NotExecuted);
                command.job_id = Some(id.clone());
                let result = JobResult {
                    command,
                    job_id: id.clone(),
                    successful: false,
                    exit_code: -1,
                    result_lines: vec![format!("Parent job {parent} did not finish successfully")],
                    tool: job.tool().map(|tool| tool.to_path_buf()),
                    parameters: job.parameters().clone(),
                    parents,
                };
                job.set_submitted(id, JobState::Failed, result.clone());
                return Ok(result);
            }
        };

        let mut command = build_submit_command(self.adapter.as_ref(), job, &dependencies, hold)?;
        log::debug!("Submitting job {} with `{}`", job.name(), command.command_line());
        let execution = self.executor.execute(&command).await;
        log::trace!("Submission output of job {}:\n{}", job.name(), execution.output());

        let (id, successful) = self.submitted_id(job.name(), &execution);
        let state = self.adapter.state_after_submission(successful, hold);
        command.job_id = Some(id.clone());
        let result = JobResult {
            command,
            job_id: id.clone(),
            successful,
            exit_code: execution.exit_code,
            result_lines: execution.result_lines,
            tool: job.tool().map(|tool| tool.to_path_buf()),
            parameters: job.parameters().clone(),
            parents,
        };
        job.set_submitted(id, state, result.clone());
        if successful && self.adapter.requires_polling() {
            self.synchronizer.track(job).await;
        }
        Ok(result)
    }

    fn submitted_id(&self, name: &str, execution: &ExecutionResult) -> (JobId, bool) {
        if !execution.successful {
            log::warn!(
                "Submission of job {name} failed with exit code {}\n{}",
                execution.exit_code,
                execution.output()
            );
            return (JobId::Fake(FakeReason::NotExecuted), false);
        }
        match self.adapter.parse_submission(execution) {
            Ok(id) => (id, true),
            Err(error) => {
                log::warn!("Cannot read identifier of job {name}: {error:?}");
                (JobId::Fake(FakeReason::NotExecuted), false)
            }
        }
    }

    /// Releases held jobs with one batch command.
    ///
    /// Nothing happens if jobs are not held on submission. The states of the jobs are not
    /// changed, the next status refresh reports the effect.
    pub async fn start_held_jobs(&self, jobs: &[JobRef]) -> crate::Result<()> {
        if !self.holds_jobs() || jobs.is_empty() {
            return Ok(());
        }
        let ids: Vec<JobId> = jobs.iter().filter_map(|job| job.id()).collect();
        let ids = unique_backend_ids(&ids);
        if ids.is_empty() {
            return Ok(());
        }
        let command = self.adapter.build_release_command(&ids)?;
        log::debug!("Releasing {} job(s) with `{}`", ids.len(), command.command_line());
        let result = self.executor.execute(&command).await;
        if !result.successful {
            return Err(ClusterqError::TransportError(format!(
                "Release of jobs {} failed\n{}",
                ids.join(", "),
                result.output()
            )));
        }
        Ok(())
    }

    /// Aborts jobs with one batch command and marks them as aborted.
    ///
    /// Jobs that already reached a terminal state and sentinel jobs are left out. If the command
    /// fails, no job state is changed.
    pub async fn query_job_abortion(&self, jobs: &[JobRef]) -> crate::Result<()> {
        let affected: Vec<&JobRef> = jobs
            .iter()
            .filter(|job| {
                !job.state().is_terminal() && job.id().is_some_and(|id| !id.is_fake())
            })
            .collect();
        let ids: Vec<JobId> = affected.iter().filter_map(|job| job.id()).collect();
        let ids = unique_backend_ids(&ids);
        if ids.is_empty() {
            return Ok(());
        }
        let command = self.adapter.build_abort_command(&ids)?;
        log::debug!("Aborting {} job(s) with `{}`", ids.len(), command.command_line());
        let result = self.executor.execute(&command).await;
        if !result.successful {
            return Err(ClusterqError::TransportError(format!(
                "Abort of jobs {} failed\n{}",
                ids.join(", "),
                result.output()
            )));
        }
        for job in affected {
            job.set_state(JobState::Aborted);
        }
        self.synchronizer.untrack(&ids).await;
        Ok(())
    }

    /// Returns the best known state of each job, in the order of `jobs`.
    ///
    /// Submitted jobs that are not tracked yet start to be tracked. Status is refreshed from the
    /// backend if `force_update` is set or if the cached status is missing or too old.
    pub async fn query_job_status(&self, jobs: &[JobRef], force_update: bool) -> Vec<JobState> {
        if self.adapter.requires_polling() {
            self.synchronizer.synchronize(jobs, force_update).await;
        }
        jobs.iter().map(|job| job.state()).collect()
    }

    /// Refreshes the status of a submitted job every `interval` until it leaves the planned and
    /// running states, then returns its final state.
    ///
    /// Fails if the backend stops reporting the job for [`MISSING_REPORT_LIMIT`] successive
    /// refreshes, e.g. because it already purged a finished job from its records.
    pub async fn wait_for_job(&self, job: &JobRef, interval: Duration) -> crate::Result<JobState> {
        if !self.adapter.requires_polling() {
            return Ok(job.state());
        }
        let jobs = std::slice::from_ref(job);
        let mut missing_reports = 0;
        loop {
            self.synchronizer.synchronize(jobs, true).await;
            let state = job.state();
            if !state.is_planned_or_running() {
                return Ok(state);
            }
            if self.synchronizer.is_reported(job).await {
                missing_reports = 0;
            } else {
                missing_reports += 1;
                log::debug!(
                    "Job {} is missing in the status report ({missing_reports}/{MISSING_REPORT_LIMIT})",
                    job.name()
                );
                if missing_reports >= MISSING_REPORT_LIMIT {
                    return Err(ClusterqError::GenericError(format!(
                        "Job {} is no longer reported by the backend, its last known state is {state}",
                        job.name()
                    )));
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Metadata of a job gathered from status reports.
    pub async fn get_job_info(&self, job: &JobRef) -> Option<JobInfo> {
        if let Some(info) = job.info() {
            return Some(info);
        }
        let id = job.id()?;
        self.synchronizer.cached_info(id.as_backend()?).await
    }

    pub async fn tracked_job_count(&self) -> usize {
        self.synchronizer.tracked_job_count().await
    }

    /// Starts periodic status refreshes with the configured polling interval.
    ///
    /// Does nothing for backends that do not need polling or if polling already runs.
    /// Must be called within a Tokio runtime.
    pub fn start_polling(&self) -> crate::Result<()> {
        let Some(period) = self.options.polling_interval else {
            return configuration_error("Polling interval is not configured");
        };
        if !self.adapter.requires_polling() {
            log::debug!("{} backend does not need status polling", self.adapter.backend_type());
            return Ok(());
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return configuration_error("Status polling requires a Tokio runtime");
        }
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.as_ref().is_some_and(|poller| !poller.is_finished()) {
            return Ok(());
        }
        *poller = Some(Poller::spawn(self.synchronizer.clone(), period));
        Ok(())
    }

    pub fn stop_polling(&self) {
        if let Some(poller) = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            poller.stop();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|poller| !poller.is_finished())
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.stop_polling();
    }
}
