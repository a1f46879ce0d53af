use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveDateTime};
use itertools::Itertools;

use crate::backend::{
    BackendAdapter, BackendType, StateTokenTable, StatusEntry, StatusScope, SubmitRequest,
    is_missing_value,
};
use crate::common::error::configuration_error;
use crate::execution::{ExecCommand, ExecutionResult};
use crate::job::id::JobId;
use crate::job::result::JobInfo;
use crate::job::{JobCommand, JobLog};
use crate::resources::{Memory, ParameterFragment, ResourceRenderer};

// UNKWN and ZOMBI are not listed, they resolve to an unknown state.
const LSF_STATES: StateTokenTable = StateTokenTable {
    hold: &["PSUSP", "USUSP", "SSUSP"],
    queued: &["PEND"],
    running: &["RUN", "PROV", "WAIT"],
    completed_successful: &["DONE"],
    completed_unknown: &[],
    failed: &["EXIT"],
    aborted: &[],
};

const BJOBS_FIELDS: &str = "jobid job_name stat user queue exec_host priority exit_code \
                            submit_time start_time finish_time run_time cpu_used max_mem";

/// IBM Spectrum LSF (`bsub`, `bjobs`, `bresume`, `bkill`).
#[derive(Debug, Default)]
pub struct LsfAdapter;

impl ResourceRenderer for LsfAdapter {
    fn render_queue(&self, queue: &str) -> Option<ParameterFragment> {
        Some(ParameterFragment::new(["-q", queue]))
    }

    fn render_memory(&self, kilobytes: u64) -> Option<ParameterFragment> {
        Some(ParameterFragment::new([
            "-M".to_string(),
            format!("{kilobytes}KB"),
        ]))
    }

    fn render_cores(&self, cores: u32) -> Option<ParameterFragment> {
        Some(ParameterFragment::new([
            "-n".to_string(),
            cores.to_string(),
            "-R".to_string(),
            "span[hosts=1]".to_string(),
        ]))
    }

    fn render_nodes(&self, nodes: u32) -> Option<ParameterFragment> {
        Some(ParameterFragment::new([
            "-n".to_string(),
            nodes.to_string(),
            "-R".to_string(),
            "span[ptile=1]".to_string(),
        ]))
    }

    /// LSF counts slots, not nodes. Nodes are expressed through the number of slots per host.
    fn render_nodes_and_cores(
        &self,
        nodes: Option<u32>,
        cores: Option<u32>,
    ) -> Vec<ParameterFragment> {
        match (nodes, cores) {
            (Some(nodes), Some(cores)) => vec![ParameterFragment::new([
                "-n".to_string(),
                nodes.saturating_mul(cores).to_string(),
                "-R".to_string(),
                format!("span[ptile={cores}]"),
            ])],
            (Some(nodes), None) => self.render_nodes(nodes).into_iter().collect(),
            (None, Some(cores)) => self.render_cores(cores).into_iter().collect(),
            (None, None) => Vec::new(),
        }
    }

    /// `[H:]MM`, rounded up to whole minutes.
    fn format_walltime(&self, walltime: &Duration) -> String {
        let minutes = walltime.as_secs().div_ceil(60);
        format!("{}:{:02}", minutes / 60, minutes % 60)
    }

    fn render_walltime(&self, walltime: &str) -> Option<ParameterFragment> {
        Some(ParameterFragment::new(["-W", walltime]))
    }
}

impl BackendAdapter for LsfAdapter {
    fn backend_type(&self) -> BackendType {
        BackendType::Lsf
    }

    fn hold_jobs_by_default(&self) -> bool {
        true
    }

    fn build_submit_command(&self, request: &SubmitRequest) -> crate::Result<ExecCommand> {
        let job = request.job;
        let mut command = ExecCommand::new("bsub").args(["-J", job.name()]);
        if let Some(project) = job.accounting_name() {
            command = command.args(["-P", project]);
        }
        command = match job.log() {
            JobLog::Discard => command.args(["-o", "/dev/null", "-e", "/dev/null"]),
            JobLog::Joined(path) => command.arg("-o").arg(path.display().to_string()),
            JobLog::Separate { stdout, stderr } => command
                .arg("-o")
                .arg(stdout.display().to_string())
                .arg("-e")
                .arg(stderr.display().to_string()),
        };
        if let Some(dir) = job.working_dir() {
            command = command.arg("-cwd").arg(dir.display().to_string());
        }
        command = command.args(request.parameters.to_args());
        if !job.parameters().is_empty() {
            let variables = job
                .parameters()
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .join(",");
            command = command.arg("-env").arg(format!("all,{variables}"));
        }
        if !request.dependencies.is_empty() {
            let condition = request
                .dependencies
                .iter()
                .map(|id| format!("done({id})"))
                .join(" && ");
            command = command.arg("-w").arg(condition);
        }
        if request.hold {
            command = command.arg("-H");
        }
        command = command.args(job.extra_args().iter().cloned());
        Ok(match job.command() {
            JobCommand::Tool(tool) => command.arg(tool.display().to_string()),
            JobCommand::Script(script) => command.stdin(script.as_str()),
            JobCommand::Fake => return configuration_error("Fake jobs cannot be submitted"),
        })
    }

    /// Expects `Job <1234> is submitted to queue <normal>.`
    fn parse_submission(&self, result: &ExecutionResult) -> anyhow::Result<JobId> {
        result
            .result_lines
            .iter()
            .filter_map(|line| line.trim().strip_prefix("Job <"))
            .find_map(|rest| rest.split_once('>').map(|(id, _)| id))
            .filter(|id| !id.is_empty())
            .map(JobId::backend)
            .ok_or_else(|| anyhow::anyhow!("Missing job id in bsub output\n{}", result.output()))
    }

    fn build_status_command(&self, scope: &StatusScope) -> crate::Result<ExecCommand> {
        let command = ExecCommand::new("bjobs").args([
            "-a".to_string(),
            "-noheader".to_string(),
            "-o".to_string(),
            format!("{BJOBS_FIELDS} delimiter='<'"),
        ]);
        Ok(match scope {
            StatusScope::Jobs(ids) => command.args(ids.iter().cloned()),
            StatusScope::All { user: Some(user) } => command.args(["-u", user.as_str()]),
            StatusScope::All { user: None } => command.args(["-u", "all"]),
        })
    }

    fn state_tokens(&self) -> &StateTokenTable {
        &LSF_STATES
    }

    fn field_delimiter(&self) -> &str {
        "<"
    }

    fn parse_status_fields(&self, fields: &[&str]) -> Option<StatusEntry> {
        let &[
            id,
            name,
            state,
            user,
            queue,
            host,
            priority,
            exit_code,
            submit_time,
            start_time,
            finish_time,
            run_time,
            cpu_used,
            max_mem,
            ..,
        ] = fields
        else {
            return None;
        };
        let value = |value: &str| (!is_missing_value(value)).then(|| value.to_string());
        let year = Local::now().year();
        Some(StatusEntry {
            id: id.to_string(),
            state: LSF_STATES.resolve(state),
            info: JobInfo {
                description: value(name),
                user: value(user),
                queue: value(queue),
                host: value(host),
                priority: value(priority),
                exit_code: exit_code.parse().ok(),
                submit_time: parse_lsf_time(submit_time, year),
                start_time: parse_lsf_time(start_time, year),
                end_time: parse_lsf_time(finish_time, year),
                wall_time: parse_lsf_seconds(run_time),
                cpu_time: parse_lsf_seconds(cpu_used),
                max_memory_kb: parse_lsf_memory(max_mem),
            },
        })
    }

    fn build_release_command(&self, ids: &[String]) -> crate::Result<ExecCommand> {
        Ok(ExecCommand::new("bresume").args(ids.iter().cloned()))
    }

    fn build_abort_command(&self, ids: &[String]) -> crate::Result<ExecCommand> {
        Ok(ExecCommand::new("bkill").args(ids.iter().cloned()))
    }
}

/// Parses times like `Oct 19 10:00` or `Oct 19 10:00 L`. bjobs omits the year, so the
/// given one is used. Trailing one letter flags (estimated, late, ...) are ignored.
fn parse_lsf_time(value: &str, year: i32) -> Option<DateTime<Local>> {
    if is_missing_value(value) {
        return None;
    }
    let value = value
        .split(' ')
        .filter(|part| !(part.len() == 1 && part.chars().all(|c| c.is_ascii_alphabetic())))
        .join(" ");
    NaiveDateTime::parse_from_str(&format!("{year} {value}"), "%Y %b %d %H:%M")
        .ok()
        .and_then(crate::common::utils::time::local_datetime)
}

/// Parses `95 second(s)` or `1.5 second(s)`.
fn parse_lsf_seconds(value: &str) -> Option<Duration> {
    let seconds: f64 = value.split(' ').next()?.parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

/// Parses `12 Mbytes`, `1.5 Gbytes` or `512 Kbytes` into kilobytes.
fn parse_lsf_memory(value: &str) -> Option<u64> {
    let (amount, unit) = value.split_once(' ')?;
    let amount: f64 = amount.parse().ok()?;
    let unit = unit.trim_end_matches("bytes");
    if amount.fract() == 0.0 {
        let memory: Memory = format!("{amount} {unit}").parse().ok()?;
        return memory.to_kilobytes();
    }
    let multiplier = match unit.to_ascii_uppercase().as_str() {
        "K" => 1.0,
        "M" => 1024.0,
        "G" => 1024.0 * 1024.0,
        "T" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((amount * multiplier).round() as u64)
}
