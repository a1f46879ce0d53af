use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::execution::ExecCommand;
use crate::job::id::JobId;

/// Outcome of a single submission attempt.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    /// Command that was (or would have been) executed.
    pub command: ExecCommand,
    pub job_id: JobId,
    pub successful: bool,
    pub exit_code: i32,
    pub result_lines: Vec<String>,
    pub tool: Option<PathBuf>,
    pub parameters: BTreeMap<String, String>,
    pub parents: Vec<JobId>,
}

/// Normalized job metadata reported by a backend.
///
/// Every field is optional, backends fill in whatever their status output contains.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobInfo {
    pub user: Option<String>,
    pub queue: Option<String>,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub host: Option<String>,
    pub submit_time: Option<DateTime<Local>>,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    pub exit_code: Option<i32>,
    pub wall_time: Option<Duration>,
    pub cpu_time: Option<Duration>,
    pub max_memory_kb: Option<u64>,
}

impl JobInfo {
    /// Overwrites fields of `self` with fields that are present in `update`.
    /// Fields missing in `update` are kept as they are.
    pub fn merge(&mut self, update: &JobInfo) {
        fn merge_field<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                target.clone_from(value);
            }
        }

        merge_field(&mut self.user, &update.user);
        merge_field(&mut self.queue, &update.queue);
        merge_field(&mut self.description, &update.description);
        merge_field(&mut self.priority, &update.priority);
        merge_field(&mut self.host, &update.host);
        merge_field(&mut self.submit_time, &update.submit_time);
        merge_field(&mut self.start_time, &update.start_time);
        merge_field(&mut self.end_time, &update.end_time);
        merge_field(&mut self.exit_code, &update.exit_code);
        merge_field(&mut self.wall_time, &update.wall_time);
        merge_field(&mut self.cpu_time, &update.cpu_time);
        merge_field(&mut self.max_memory_kb, &update.max_memory_kb);
    }
}
