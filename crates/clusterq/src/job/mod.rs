//! Jobs are created by clients through a [`JobContext`], submitted by a
//! [`JobManager`](crate::JobManager) and afterwards updated by status synchronization.
//!
//! A job is shared as [`JobRef`]; its identity and definition are immutable, while the
//! backend-assigned identifier, state, metadata and submission result live behind a mutex so
//! that several callers can observe the same job.
pub mod id;
pub mod result;
pub mod state;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use derive_builder::Builder;
use serde::Serialize;

use crate::Set;
use crate::common::error::configuration_error;
use crate::job::id::{FakeReason, JobId};
use crate::job::result::{JobInfo, JobResult};
use crate::job::state::JobState;
use crate::resources::ResourceSet;

pub type JobRef = Arc<Job>;

/// Where should stdout/stderr of a job go.
/// It is forwarded to the backend (or the local executor) without interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobLog {
    Discard,
    /// Both streams are written into a single file.
    Joined(PathBuf),
    Separate { stdout: PathBuf, stderr: PathBuf },
}

/// What a job executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    /// Path to an executable script or program.
    Tool(PathBuf),
    /// Inline shell script body.
    Script(String),
    /// Sentinel job which is never executed.
    Fake,
}

#[derive(Builder, Debug)]
#[builder(pattern = "owned", build_fn(error = "crate::Error"))]
pub struct JobDefinition {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default, setter(into, strip_option))]
    pub accounting_name: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub tool: Option<PathBuf>,
    #[builder(default, setter(into, strip_option))]
    pub script: Option<String>,
    #[builder(default)]
    pub resources: ResourceSet,
    #[builder(default, setter(each(name = "parameter")))]
    pub parameters: BTreeMap<String, String>,
    #[builder(default, setter(each(name = "parent")))]
    pub parents: Vec<JobRef>,
    #[builder(default, setter(into, strip_option))]
    pub working_dir: Option<PathBuf>,
    #[builder(default, setter(strip_option))]
    pub log: Option<JobLog>,
    /// Raw backend-specific submission arguments, appended after translated resources.
    #[builder(default, setter(each(name = "extra_arg", into)))]
    pub extra_args: Vec<String>,
}

/// Creates jobs and hands out their creation numbers.
#[derive(Debug, Default)]
pub struct JobContext {
    counter: AtomicU64,
}

impl JobContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_number(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn create_job(&self, definition: JobDefinition) -> crate::Result<JobRef> {
        let JobDefinition {
            name,
            accounting_name,
            tool,
            script,
            resources,
            parameters,
            parents,
            working_dir,
            log,
            extra_args,
        } = definition;

        let command = match (tool, script) {
            (Some(tool), None) => JobCommand::Tool(tool),
            (None, Some(script)) => JobCommand::Script(script),
            (Some(_), Some(_)) => {
                return configuration_error(format!(
                    "Job {name} cannot have both a tool and an inline script"
                ));
            }
            (None, None) => {
                return configuration_error(format!(
                    "Job {name} needs either a tool or an inline script"
                ));
            }
        };
        let Some(log) = log else {
            return configuration_error(format!("Job {name} has no log destination"));
        };

        Ok(Arc::new(Job {
            number: self.next_number(),
            name,
            accounting_name,
            command,
            resources,
            parameters,
            parents: dedup_parents(parents),
            working_dir,
            log,
            extra_args,
            runtime: Mutex::new(JobRuntime::new(None, JobState::Unstarted)),
        }))
    }

    /// Creates a sentinel job that has neither a tool nor a script and is never submitted.
    pub fn create_fake_job(&self, reason: FakeReason, state: JobState) -> JobRef {
        let number = self.next_number();
        Arc::new(Job {
            number,
            name: format!("fake-{number}"),
            accounting_name: None,
            command: JobCommand::Fake,
            resources: ResourceSet::default(),
            parameters: Default::default(),
            parents: Vec::new(),
            working_dir: None,
            log: JobLog::Discard,
            extra_args: Vec::new(),
            runtime: Mutex::new(JobRuntime::new(Some(JobId::Fake(reason)), state)),
        })
    }
}

/// Parents are kept in their original order, duplicates (by identifier, or by identity for
/// parents that were not submitted yet) are dropped.
fn dedup_parents(parents: Vec<JobRef>) -> Vec<JobRef> {
    let mut seen = Set::default();
    parents
        .into_iter()
        .filter(|parent| {
            let key = match parent.id() {
                Some(id) => id.to_string(),
                None => format!("#{}", parent.number()),
            };
            seen.insert(key)
        })
        .collect()
}

#[derive(Debug)]
struct JobRuntime {
    id: Option<JobId>,
    state: JobState,
    info: Option<JobInfo>,
    result: Option<JobResult>,
}

impl JobRuntime {
    fn new(id: Option<JobId>, state: JobState) -> Self {
        Self {
            id,
            state,
            info: None,
            result: None,
        }
    }
}

#[derive(Debug)]
pub struct Job {
    number: u64,
    name: String,
    accounting_name: Option<String>,
    command: JobCommand,
    resources: ResourceSet,
    parameters: BTreeMap<String, String>,
    parents: Vec<JobRef>,
    working_dir: Option<PathBuf>,
    log: JobLog,
    extra_args: Vec<String>,
    runtime: Mutex<JobRuntime>,
}

impl Job {
    /// Creation number, unique and increasing within one [`JobContext`].
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accounting_name(&self) -> Option<&str> {
        self.accounting_name.as_deref()
    }

    pub fn command(&self) -> &JobCommand {
        &self.command
    }

    pub fn tool(&self) -> Option<&Path> {
        match &self.command {
            JobCommand::Tool(path) => Some(path),
            _ => None,
        }
    }

    pub fn script(&self) -> Option<&str> {
        match &self.command {
            JobCommand::Script(script) => Some(script),
            _ => None,
        }
    }

    pub fn is_fake(&self) -> bool {
        matches!(self.command, JobCommand::Fake)
    }

    pub fn resources(&self) -> &ResourceSet {
        &self.resources
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn parents(&self) -> &[JobRef] {
        &self.parents
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn log(&self) -> &JobLog {
        &self.log
    }

    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }

    pub fn id(&self) -> Option<JobId> {
        self.runtime().id.clone()
    }

    pub fn state(&self) -> JobState {
        self.runtime().state
    }

    /// Metadata gathered from backend status reports so far.
    pub fn info(&self) -> Option<JobInfo> {
        self.runtime().info.clone()
    }

    pub fn result(&self) -> Option<JobResult> {
        self.runtime().result.clone()
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.runtime().state = state;
    }

    pub(crate) fn set_submitted(&self, id: JobId, state: JobState, result: JobResult) {
        let mut runtime = self.runtime();
        runtime.id = Some(id);
        runtime.state = state;
        runtime.result = Some(result);
    }

    /// Applies a state reported by status synchronization.
    /// Terminal states are kept, returns `false` if the update was ignored.
    pub(crate) fn apply_reported_state(&self, state: JobState, info: Option<&JobInfo>) -> bool {
        let mut runtime = self.runtime();
        if runtime.state.is_terminal() {
            return false;
        }
        runtime.state = state;
        if let Some(update) = info {
            runtime.info.get_or_insert_with(JobInfo::default).merge(update);
        }
        true
    }

    fn runtime(&self) -> MutexGuard<'_, JobRuntime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
