use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Unstarted,
    Hold,
    Queued,
    Running,
    CompletedSuccessful,
    /// The job has finished, but its exit status is not known.
    CompletedUnknown,
    Failed,
    Aborted,
    Unknown,
    /// The backend reported the job in a state that could not be recognized.
    UnknownSubmitted,
}

impl JobState {
    /// Terminal states are never changed by status synchronization.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Failed | JobState::CompletedSuccessful | JobState::Aborted
        )
    }

    /// Returns true if the job waits in a queue or is being executed.
    pub fn is_planned_or_running(self) -> bool {
        matches!(self, JobState::Hold | JobState::Queued | JobState::Running)
    }

    /// States of a parent job that allow a dependent job to be executed directly.
    pub fn allows_dependent_start(self) -> bool {
        matches!(self, JobState::CompletedSuccessful | JobState::Unknown)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Unstarted => "UNSTARTED",
            JobState::Hold => "HOLD",
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::CompletedSuccessful => "COMPLETED_SUCCESSFUL",
            JobState::CompletedUnknown => "COMPLETED_UNKNOWN",
            JobState::Failed => "FAILED",
            JobState::Aborted => "ABORTED",
            JobState::Unknown => "UNKNOWN",
            JobState::UnknownSubmitted => "UNKNOWN_SUBMITTED",
        };
        f.write_str(name)
    }
}
