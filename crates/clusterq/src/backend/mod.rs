//! Backend adapters translate jobs into scheduler commands and scheduler output back into
//! job states. Nothing outside of this module knows which backend it talks to.
mod common;
pub mod direct;
pub mod lsf;
pub mod pbs;
pub mod slurm;

pub use common::{is_missing_value, leading_job_id, parse_status_lines, split_status_line};

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Map;
use crate::execution::{ExecCommand, ExecutionResult};
use crate::job::Job;
use crate::job::id::JobId;
use crate::job::result::JobInfo;
use crate::job::state::JobState;
use crate::resources::{ProcessingParameters, ResourceRenderer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Pbs,
    Slurm,
    Lsf,
    Direct,
}

impl Display for BackendType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Pbs => f.write_str("PBS"),
            BackendType::Slurm => f.write_str("SLURM"),
            BackendType::Lsf => f.write_str("LSF"),
            BackendType::Direct => f.write_str("DIRECT"),
        }
    }
}

impl FromStr for BackendType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "pbs" => Self::Pbs,
            "slurm" => Self::Slurm,
            "lsf" => Self::Lsf,
            "direct" | "local" => Self::Direct,
            _ => anyhow::bail!("Unknown backend {s}, use one of pbs, slurm, lsf or direct"),
        })
    }
}

pub fn create_adapter(backend: BackendType) -> Arc<dyn BackendAdapter> {
    match backend {
        BackendType::Pbs => Arc::new(pbs::PbsAdapter),
        BackendType::Slurm => Arc::new(slurm::SlurmAdapter),
        BackendType::Lsf => Arc::new(lsf::LsfAdapter),
        BackendType::Direct => Arc::new(direct::DirectAdapter),
    }
}

/// How are dependencies between jobs expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyMode {
    /// Parent identifiers are passed to the scheduler, which defers the job.
    QueueMediated,
    /// Parents are checked before submission, the job is not submitted if any of them
    /// did not finish successfully.
    PreFlight,
}

/// Maps backend-native state tokens to [`JobState`].
/// Tokens that are not listed resolve to [`JobState::UnknownSubmitted`].
#[derive(Debug)]
pub struct StateTokenTable {
    pub hold: &'static [&'static str],
    pub queued: &'static [&'static str],
    pub running: &'static [&'static str],
    pub completed_successful: &'static [&'static str],
    pub completed_unknown: &'static [&'static str],
    pub failed: &'static [&'static str],
    pub aborted: &'static [&'static str],
}

impl StateTokenTable {
    pub const EMPTY: StateTokenTable = StateTokenTable {
        hold: &[],
        queued: &[],
        running: &[],
        completed_successful: &[],
        completed_unknown: &[],
        failed: &[],
        aborted: &[],
    };

    pub fn resolve(&self, token: &str) -> JobState {
        let groups = [
            (self.hold, JobState::Hold),
            (self.queued, JobState::Queued),
            (self.running, JobState::Running),
            (self.completed_successful, JobState::CompletedSuccessful),
            (self.completed_unknown, JobState::CompletedUnknown),
            (self.failed, JobState::Failed),
            (self.aborted, JobState::Aborted),
        ];
        groups
            .iter()
            .find(|(tokens, _)| tokens.contains(&token))
            .map(|(_, state)| *state)
            .unwrap_or(JobState::UnknownSubmitted)
    }
}

/// A single job parsed from a bulk status report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    pub id: String,
    pub state: JobState,
    pub info: JobInfo,
}

/// Which jobs should a status query report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusScope {
    Jobs(Vec<String>),
    All { user: Option<String> },
}

/// Everything an adapter needs to build a submission command.
pub struct SubmitRequest<'a> {
    pub job: &'a Job,
    pub parameters: &'a ProcessingParameters,
    /// Deduplicated backend identifiers of parents that the job should wait for.
    pub dependencies: &'a [String],
    pub hold: bool,
}

/// Adapter for a single kind of backend.
pub trait BackendAdapter: ResourceRenderer + Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Should jobs be submitted in a held state and released explicitly?
    fn hold_jobs_by_default(&self) -> bool;

    fn dependency_mode(&self) -> DependencyMode {
        DependencyMode::QueueMediated
    }

    /// Backends that finish jobs during submission have nothing to poll.
    fn requires_polling(&self) -> bool {
        true
    }

    fn build_submit_command(&self, request: &SubmitRequest) -> crate::Result<ExecCommand>;

    /// Extracts the identifier of a submitted job from the result of a successful submission.
    fn parse_submission(&self, result: &ExecutionResult) -> anyhow::Result<JobId>;

    /// State of a job right after its submission command has finished.
    fn state_after_submission(&self, successful: bool, hold: bool) -> JobState {
        match (successful, hold) {
            (false, _) => JobState::Failed,
            (true, true) => JobState::Hold,
            (true, false) => JobState::Queued,
        }
    }

    fn build_status_command(&self, scope: &StatusScope) -> crate::Result<ExecCommand>;

    fn state_tokens(&self) -> &StateTokenTable;

    /// Separator of columns in status output lines (after whitespace runs were collapsed
    /// into single spaces).
    fn field_delimiter(&self) -> &str {
        " "
    }

    /// Parses the columns of a single status line.
    fn parse_status_fields(&self, _fields: &[&str]) -> Option<StatusEntry> {
        None
    }

    /// Parses the whole output of a status command.
    ///
    /// By default, lines that start with a job identifier are split into columns and handed to
    /// [`BackendAdapter::parse_status_fields`]. Backends with structured output override this.
    fn parse_status_output(&self, lines: &[String]) -> anyhow::Result<Map<String, StatusEntry>> {
        Ok(parse_status_lines(self, lines))
    }

    fn build_release_command(&self, ids: &[String]) -> crate::Result<ExecCommand>;

    fn build_abort_command(&self, ids: &[String]) -> crate::Result<ExecCommand>;
}

#[cfg(test)]
mod tests {
    use super::{BackendType, StateTokenTable};
    use crate::job::state::JobState;

    #[test]
    fn resolve_tokens() {
        let table = StateTokenTable {
            queued: &["PEND"],
            running: &["RUN"],
            ..StateTokenTable::EMPTY
        };
        assert_eq!(table.resolve("PEND"), JobState::Queued);
        assert_eq!(table.resolve("RUN"), JobState::Running);
        assert_eq!(table.resolve("ZOMBI"), JobState::UnknownSubmitted);
    }

    #[test]
    fn parse_backend_type() {
        assert_eq!("PBS".parse::<BackendType>().unwrap(), BackendType::Pbs);
        assert_eq!("local".parse::<BackendType>().unwrap(), BackendType::Direct);
        assert!("sge".parse::<BackendType>().is_err());
    }
}
