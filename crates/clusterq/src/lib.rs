//! Submission, control and status tracking of jobs on cluster batch schedulers (PBS, Slurm, LSF)
//! and on the local machine, behind one backend-agnostic job manager.

pub mod backend;
pub mod common;
pub mod execution;
pub mod job;
pub mod manager;
pub mod resources;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::ClusterqError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V, fxhash::FxBuildHasher>;
pub type Set<T> = hashbrown::HashSet<T, fxhash::FxBuildHasher>;

pub use backend::{BackendAdapter, BackendType, create_adapter};
pub use execution::{ExecCommand, ExecutionResult, Executor, LocalExecutor};
pub use job::id::{FakeReason, JobId};
pub use job::result::{JobInfo, JobResult};
pub use job::state::JobState;
pub use job::{Job, JobContext, JobDefinition, JobDefinitionBuilder, JobLog, JobRef};
pub use manager::JobManager;
pub use resources::{Memory, MemoryUnit, ProcessingParameters, ResourceSet};

pub const CLUSTERQ_VERSION: &str = env!("CARGO_PKG_VERSION");
