use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDateTime;
use itertools::Itertools;

use crate::Map;
use crate::backend::{
    BackendAdapter, BackendType, StateTokenTable, StatusEntry, StatusScope, SubmitRequest,
    is_missing_value,
};
use crate::common::error::configuration_error;
use crate::common::utils::time::{format_hms_duration, local_datetime, parse_hms_time};
use crate::execution::{ExecCommand, ExecutionResult};
use crate::job::id::JobId;
use crate::job::result::JobInfo;
use crate::job::state::JobState;
use crate::job::{JobCommand, JobLog};
use crate::resources::{Memory, ParameterFragment, ResourceRenderer};

/// Finished jobs (`F`, `X` for array subjobs) are resolved by their exit status instead.
const PBS_STATES: StateTokenTable = StateTokenTable {
    hold: &["H", "S", "U"],
    queued: &["Q", "W", "T", "M"],
    running: &["R", "E", "B"],
    completed_successful: &[],
    completed_unknown: &[],
    failed: &[],
    aborted: &[],
};

/// PBS Pro (`qsub`, `qstat`, `qrls`, `qdel`).
#[derive(Debug, Default)]
pub struct PbsAdapter;

impl ResourceRenderer for PbsAdapter {
    fn render_queue(&self, queue: &str) -> Option<ParameterFragment> {
        Some(ParameterFragment::new(["-q", queue]))
    }

    fn render_memory(&self, kilobytes: u64) -> Option<ParameterFragment> {
        Some(ParameterFragment::new([
            "-l".to_string(),
            format!("mem={kilobytes}kb"),
        ]))
    }

    fn render_cores(&self, cores: u32) -> Option<ParameterFragment> {
        Some(ParameterFragment::new(["-l".to_string(), format!("ncpus={cores}")]))
    }

    fn render_nodes(&self, nodes: u32) -> Option<ParameterFragment> {
        Some(ParameterFragment::new(["-l".to_string(), format!("select={nodes}")]))
    }

    /// Cores are requested per node (`select=N:ncpus=C`) when both are given.
    fn render_nodes_and_cores(
        &self,
        nodes: Option<u32>,
        cores: Option<u32>,
    ) -> Vec<ParameterFragment> {
        match (nodes, cores) {
            (Some(nodes), Some(cores)) => vec![ParameterFragment::new([
                "-l".to_string(),
                format!("select={nodes}:ncpus={cores}"),
            ])],
            (Some(nodes), None) => self.render_nodes(nodes).into_iter().collect(),
            (None, Some(cores)) => self.render_cores(cores).into_iter().collect(),
            (None, None) => vec![],
        }
    }

    fn format_walltime(&self, walltime: &Duration) -> String {
        format_hms_duration(walltime)
    }

    fn render_walltime(&self, walltime: &str) -> Option<ParameterFragment> {
        Some(ParameterFragment::new([
            "-l".to_string(),
            format!("walltime={walltime}"),
        ]))
    }
}

impl BackendAdapter for PbsAdapter {
    fn backend_type(&self) -> BackendType {
        BackendType::Pbs
    }

    /// Jobs whose parents have already finished and left the server would otherwise be
    /// rejected or started out of order.
    fn hold_jobs_by_default(&self) -> bool {
        true
    }

    fn build_submit_command(&self, request: &SubmitRequest) -> crate::Result<ExecCommand> {
        let job = request.job;
        let mut command = ExecCommand::new("qsub").args(["-N", job.name()]);
        if let Some(account) = job.accounting_name() {
            command = command.args(["-A", account]);
        }
        command = match job.log() {
            JobLog::Discard => command.args(["-o", "/dev/null", "-e", "/dev/null"]),
            JobLog::Joined(path) => command
                .args(["-j", "oe", "-o"])
                .arg(path.display().to_string()),
            JobLog::Separate { stdout, stderr } => command
                .arg("-o")
                .arg(stdout.display().to_string())
                .arg("-e")
                .arg(stderr.display().to_string()),
        };
        command = command.args(request.parameters.to_args());
        if !job.parameters().is_empty() {
            let variables = job
                .parameters()
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .join(",");
            command = command.args(["-v".to_string(), variables]);
        }
        if !request.dependencies.is_empty() {
            command = command.args([
                "-W".to_string(),
                format!("depend=afterok:{}", request.dependencies.join(":")),
            ]);
        }
        if request.hold {
            command = command.arg("-h");
        }
        command = command
            .args(job.extra_args().iter().cloned())
            .working_dir(job.working_dir().map(|dir| dir.to_path_buf()));
        Ok(match job.command() {
            JobCommand::Tool(tool) => command.arg(tool.display().to_string()),
            JobCommand::Script(script) => command.stdin(script.clone()),
            JobCommand::Fake => return configuration_error("Fake jobs cannot be submitted"),
        })
    }

    /// `qsub` prints `<number>.<server>`, only the number is used as the identifier.
    fn parse_submission(&self, result: &ExecutionResult) -> anyhow::Result<JobId> {
        let line = result
            .result_lines
            .iter()
            .map(|line| line.trim())
            .find(|line| !line.is_empty())
            .context("Missing job id in qsub output")?;
        Ok(JobId::backend(normalize_pbs_id(line)))
    }

    fn build_status_command(&self, scope: &StatusScope) -> crate::Result<ExecCommand> {
        // -x also shows finished jobs, -t expands array jobs
        let command = ExecCommand::new("qstat").args(["-x", "-t", "-f", "-F", "json"]);
        Ok(match scope {
            StatusScope::Jobs(ids) => command.args(ids.iter().cloned()),
            // The full output cannot be filtered by user
            StatusScope::All { .. } => command,
        })
    }

    fn state_tokens(&self) -> &StateTokenTable {
        &PBS_STATES
    }

    /// `qstat -F json` prints one document with jobs keyed by their full identifier.
    fn parse_status_output(&self, lines: &[String]) -> anyhow::Result<Map<String, StatusEntry>> {
        let output = lines.join("\n");
        let mut entries = Map::default();
        if output.trim().is_empty() {
            return Ok(entries);
        }
        let data: serde_json::Value =
            serde_json::from_str(&output).context("Cannot parse qstat JSON output")?;
        let Some(jobs) = data["Jobs"].as_object() else {
            return Ok(entries);
        };
        for (id, job) in jobs {
            match parse_pbs_job(id, job) {
                Ok(entry) => {
                    entries.insert(entry.id.clone(), entry);
                }
                Err(error) => log::trace!("Skipping qstat record of job {id}: {error:?}"),
            }
        }
        Ok(entries)
    }

    fn build_release_command(&self, ids: &[String]) -> crate::Result<ExecCommand> {
        Ok(ExecCommand::new("qrls").args(ids.iter().cloned()))
    }

    fn build_abort_command(&self, ids: &[String]) -> crate::Result<ExecCommand> {
        Ok(ExecCommand::new("qdel").args(ids.iter().cloned()))
    }
}

fn normalize_pbs_id(id: &str) -> String {
    id.split('.').next().unwrap_or(id).to_string()
}

pub fn parse_pbs_datetime(datetime: &str) -> anyhow::Result<NaiveDateTime> {
    Ok(NaiveDateTime::parse_from_str(
        datetime,
        "%a %b %d %H:%M:%S %Y",
    )?)
}

fn get_json_str<'a>(value: &'a serde_json::Value, context: &str) -> anyhow::Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("JSON key {context} not found"))
}

fn parse_pbs_job(id: &str, job: &serde_json::Value) -> anyhow::Result<StatusEntry> {
    let exit_code = job["Exit_status"]
        .as_i64()
        .and_then(|code| i32::try_from(code).ok());
    let state = match get_json_str(&job["job_state"], "job_state")? {
        "F" | "X" | "C" if exit_code == Some(0) => JobState::CompletedSuccessful,
        "F" | "X" | "C" => JobState::Failed,
        token => PBS_STATES.resolve(token),
    };

    let text = |value: &serde_json::Value| {
        value
            .as_str()
            .filter(|value| !is_missing_value(value))
            .map(|value| value.to_string())
    };
    let time = |key: &str| {
        job[key]
            .as_str()
            .and_then(|value| parse_pbs_datetime(value).ok())
            .and_then(local_datetime)
    };
    let used = &job["resources_used"];
    let used_time = |key: &str| used[key].as_str().and_then(|value| parse_hms_time(value).ok());

    Ok(StatusEntry {
        id: normalize_pbs_id(id),
        state,
        info: JobInfo {
            description: text(&job["Job_Name"]),
            user: text(&job["Job_Owner"])
                .map(|owner| owner.split('@').next().unwrap_or_default().to_string()),
            queue: text(&job["queue"]),
            priority: job["Priority"].as_i64().map(|priority| priority.to_string()),
            host: text(&job["exec_host"])
                .map(|host| host.split(['/', '+']).next().unwrap_or_default().to_string()),
            submit_time: time("ctime"),
            start_time: time("stime"),
            end_time: state.is_terminal().then(|| time("mtime")).flatten(),
            exit_code,
            wall_time: used_time("walltime"),
            cpu_time: used_time("cput"),
            max_memory_kb: used["mem"]
                .as_str()
                .and_then(|mem| mem.parse::<Memory>().ok())
                .and_then(|mem| mem.to_kilobytes()),
        },
    })
}
