use std::time::Duration;

use chrono::{DateTime, Local};
use itertools::Itertools;

use crate::backend::{
    BackendAdapter, BackendType, StateTokenTable, StatusEntry, StatusScope, SubmitRequest,
    is_missing_value,
};
use crate::common::error::configuration_error;
use crate::common::utils::time::{format_hms_duration, local_datetime, parse_day_hms_time};
use crate::execution::{ExecCommand, ExecutionResult};
use crate::job::id::JobId;
use crate::job::result::JobInfo;
use crate::job::state::JobState;
use crate::job::{JobCommand, JobLog};
use crate::resources::{ParameterFragment, ResourceRenderer};

const SLURM_STATES: StateTokenTable = StateTokenTable {
    hold: &["SUSPENDED", "STOPPED", "REQUEUE_HOLD", "RESV_DEL_HOLD"],
    queued: &["PENDING", "CONFIGURING", "REQUEUED", "REQUEUE_FED"],
    running: &[
        "RUNNING",
        "COMPLETING",
        "STAGE_OUT",
        "SIGNALING",
        "RESIZING",
    ],
    completed_successful: &["COMPLETED"],
    completed_unknown: &[],
    failed: &[
        "FAILED",
        "TIMEOUT",
        "NODE_FAIL",
        "OUT_OF_MEMORY",
        "BOOT_FAIL",
        "DEADLINE",
        "PREEMPTED",
    ],
    aborted: &["CANCELLED", "REVOKED"],
};

/// Pending reasons which mean that the job waits for an explicit release.
const HOLD_REASONS: [&str; 2] = ["JobHeldUser", "JobHeldAdmin"];

/// `squeue` output format: id, name, state, user, partition, priority, nodes, submit time,
/// start time, end time, time used, reason.
const SQUEUE_FORMAT: &str = "%i|%j|%T|%u|%P|%Q|%N|%V|%S|%e|%M|%r";

/// Slurm (`sbatch`, `squeue`, `scontrol release`, `scancel`).
#[derive(Debug, Default)]
pub struct SlurmAdapter;

impl ResourceRenderer for SlurmAdapter {
    fn render_queue(&self, queue: &str) -> Option<ParameterFragment> {
        Some(ParameterFragment::new([format!("--partition={queue}")]))
    }

    fn render_memory(&self, kilobytes: u64) -> Option<ParameterFragment> {
        Some(ParameterFragment::new([format!("--mem={kilobytes}K")]))
    }

    fn render_cores(&self, cores: u32) -> Option<ParameterFragment> {
        Some(ParameterFragment::new([format!("--cpus-per-task={cores}")]))
    }

    fn render_nodes(&self, nodes: u32) -> Option<ParameterFragment> {
        Some(ParameterFragment::new([format!("--nodes={nodes}")]))
    }

    /// Format a duration as a Slurm time string, e.g. 01:05:02 or 2-01:05:02.
    fn format_walltime(&self, walltime: &Duration) -> String {
        let day = 24 * 3600;
        let days = walltime.as_secs() / day;
        let rest = Duration::from_secs(walltime.as_secs() % day);
        if days > 0 {
            format!("{days}-{}", format_hms_duration(&rest))
        } else {
            format_hms_duration(&rest)
        }
    }

    fn render_walltime(&self, walltime: &str) -> Option<ParameterFragment> {
        Some(ParameterFragment::new([format!("--time={walltime}")]))
    }
}

impl BackendAdapter for SlurmAdapter {
    fn backend_type(&self) -> BackendType {
        BackendType::Slurm
    }

    /// Slurm keeps dependencies of finished jobs (`--kill-on-invalid-dep` is not set), so
    /// jobs can be released right away.
    fn hold_jobs_by_default(&self) -> bool {
        false
    }

    fn build_submit_command(&self, request: &SubmitRequest) -> crate::Result<ExecCommand> {
        let job = request.job;
        let mut command = ExecCommand::new("sbatch")
            .arg("--parsable")
            .arg(format!("--job-name={}", job.name()));
        if let Some(account) = job.accounting_name() {
            command = command.arg(format!("--account={account}"));
        }
        command = match job.log() {
            JobLog::Discard => command.args(["--output=/dev/null", "--error=/dev/null"]),
            JobLog::Joined(path) => command.arg(format!("--output={}", path.display())),
            JobLog::Separate { stdout, stderr } => command
                .arg(format!("--output={}", stdout.display()))
                .arg(format!("--error={}", stderr.display())),
        };
        if let Some(dir) = job.working_dir() {
            command = command.arg(format!("--chdir={}", dir.display()));
        }
        command = command.args(request.parameters.to_args());
        if !job.parameters().is_empty() {
            let variables = job
                .parameters()
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .join(",");
            command = command.arg(format!("--export=ALL,{variables}"));
        }
        if !request.dependencies.is_empty() {
            command = command.arg(format!(
                "--dependency=afterok:{}",
                request.dependencies.join(":")
            ));
        }
        if request.hold {
            command = command.arg("--hold");
        }
        command = command.args(job.extra_args().iter().cloned());
        Ok(match job.command() {
            JobCommand::Tool(tool) => command.arg(tool.display().to_string()),
            JobCommand::Script(script) => command.stdin(with_shebang(script)),
            JobCommand::Fake => return configuration_error("Fake jobs cannot be submitted"),
        })
    }

    /// Supports both `--parsable` output (`<id>[;cluster]`) and the default
    /// `Submitted batch job <id>` message.
    fn parse_submission(&self, result: &ExecutionResult) -> anyhow::Result<JobId> {
        result
            .result_lines
            .iter()
            .map(|line| line.trim())
            .find_map(|line| {
                if line.to_lowercase().starts_with("submitted batch job") {
                    line.split(' ').nth(3)
                } else {
                    line.split(';')
                        .next()
                        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
                }
            })
            .map(JobId::backend)
            .ok_or_else(|| {
                anyhow::anyhow!("Missing job id in sbatch output\n{}", result.output())
            })
    }

    fn build_status_command(&self, scope: &StatusScope) -> crate::Result<ExecCommand> {
        let command = ExecCommand::new("squeue")
            .args(["--noheader", "--states=all"])
            .arg(format!("--format={SQUEUE_FORMAT}"));
        Ok(match scope {
            StatusScope::Jobs(ids) => command.arg(format!("--jobs={}", ids.join(","))),
            StatusScope::All { user: Some(user) } => command.arg(format!("--user={user}")),
            StatusScope::All { user: None } => command,
        })
    }

    fn state_tokens(&self) -> &StateTokenTable {
        &SLURM_STATES
    }

    fn field_delimiter(&self) -> &str {
        "|"
    }

    fn parse_status_fields(&self, fields: &[&str]) -> Option<StatusEntry> {
        let &[
            id,
            name,
            state,
            user,
            partition,
            priority,
            nodes,
            submit_time,
            start_time,
            end_time,
            time_used,
            reason,
            ..,
        ] = fields
        else {
            return None;
        };
        let value = |value: &str| (!is_missing_value(value)).then(|| value.to_string());
        let mut state = SLURM_STATES.resolve(state);
        if state == JobState::Queued && HOLD_REASONS.contains(&reason) {
            state = JobState::Hold;
        }
        Some(StatusEntry {
            id: id.to_string(),
            state,
            info: JobInfo {
                description: value(name),
                user: value(user),
                queue: value(partition),
                priority: value(priority),
                host: value(nodes),
                submit_time: parse_slurm_time(submit_time),
                start_time: parse_slurm_time(start_time),
                end_time: parse_slurm_time(end_time),
                wall_time: parse_day_hms_time(time_used).ok(),
                ..Default::default()
            },
        })
    }

    fn build_release_command(&self, ids: &[String]) -> crate::Result<ExecCommand> {
        Ok(ExecCommand::new("scontrol").args(["release".to_string(), ids.join(",")]))
    }

    fn build_abort_command(&self, ids: &[String]) -> crate::Result<ExecCommand> {
        Ok(ExecCommand::new("scancel").args(ids.iter().cloned()))
    }
}

/// `sbatch` refuses scripts without an interpreter line.
fn with_shebang(script: &str) -> String {
    if script.starts_with("#!") {
        script.to_string()
    } else {
        format!("#!/bin/bash\n{script}")
    }
}

pub fn parse_slurm_datetime(datetime: &str) -> anyhow::Result<chrono::NaiveDateTime> {
    Ok(chrono::NaiveDateTime::parse_from_str(
        datetime,
        "%Y-%m-%dT%H:%M:%S",
    )?)
}

fn parse_slurm_time(value: &str) -> Option<DateTime<Local>> {
    if is_missing_value(value) || value == "Unknown" {
        return None;
    }
    parse_slurm_datetime(value).ok().and_then(local_datetime)
}

#[cfg(test)]
mod tests {
    use super::{SlurmAdapter, parse_slurm_datetime};
    use crate::backend::{BackendAdapter, StatusScope, SubmitRequest, parse_status_lines};
    use crate::execution::ExecutionResult;
    use crate::job::id::JobId;
    use crate::job::state::JobState;
    use crate::job::{JobContext, JobDefinitionBuilder, JobLog};
    use crate::resources::{Memory, MemoryUnit, ResourceRenderer, ResourceSet, translate_resources};
    use std::time::Duration;

    #[test]
    fn test_parse_slurm_datetime() {
        let date = parse_slurm_datetime("2021-09-29T09:36:56").unwrap();
        assert_eq!(
            date.format("%d.%m.%Y %H:%M:%S").to_string(),
            "29.09.2021 09:36:56"
        );
    }

    #[test]
    fn format_walltime() {
        assert_eq!(
            SlurmAdapter.format_walltime(&Duration::from_secs(30 * 60)),
            "00:30:00"
        );
        assert_eq!(
            SlurmAdapter.format_walltime(&Duration::from_secs(2 * 24 * 3600 + 3661)),
            "2-01:01:01"
        );
    }

    #[test]
    fn translate_resources_independently() {
        let params = translate_resources(
            &ResourceSet {
                queue: Some("short".to_string()),
                memory: Some(Memory::new(10, MemoryUnit::M)),
                cores: Some(2),
                nodes: Some(1),
                walltime: Some(Duration::from_secs(30 * 60)),
            },
            &SlurmAdapter,
        )
        .unwrap();
        assert_eq!(
            params.to_args(),
            vec![
                "--partition=short",
                "--mem=10240K",
                "--nodes=1",
                "--cpus-per-task=2",
                "--time=00:30:00"
            ]
        );
    }

    #[test]
    fn build_submit_command() {
        let ctx = JobContext::new();
        let job = ctx
            .create_job(
                JobDefinitionBuilder::default()
                    .name("sort")
                    .script("sort data.txt")
                    .working_dir("/scratch/run")
                    .log(JobLog::Separate {
                        stdout: "/tmp/out".into(),
                        stderr: "/tmp/err".into(),
                    })
                    .extra_arg("--qos=long")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let deps = vec!["5".to_string()];
        let command = SlurmAdapter
            .build_submit_command(&SubmitRequest {
                job: &job,
                parameters: &Default::default(),
                dependencies: &deps,
                hold: false,
            })
            .unwrap();
        insta::assert_snapshot!(command.command_line(), @"sbatch --parsable --job-name=sort --output=/tmp/out --error=/tmp/err --chdir=/scratch/run --dependency=afterok:5 --qos=long");
        assert_eq!(command.stdin.as_deref(), Some("#!/bin/bash\nsort data.txt"));
    }

    #[test]
    fn parse_sbatch_output() {
        let parse = |lines: &[&str]| {
            SlurmAdapter.parse_submission(&ExecutionResult::success(
                lines.iter().map(|s| s.to_string()).collect(),
            ))
        };
        assert_eq!(parse(&["4641914"]).unwrap(), JobId::backend("4641914"));
        assert_eq!(parse(&["17;cluster"]).unwrap(), JobId::backend("17"));
        assert_eq!(
            parse(&["Submitted batch job 99"]).unwrap(),
            JobId::backend("99")
        );
        assert!(parse(&["sbatch: error: invalid partition"]).is_err());
    }

    #[test]
    fn parse_squeue_output() {
        let lines: Vec<String> = [
            "101|align|RUNNING|alice|short|4294|node01|2021-10-07T11:14:47|2021-10-07T11:15:26|2021-10-07T11:30:26|1:34|None",
            "102|merge|PENDING|alice|short|4294||2021-10-07T11:14:48|N/A|N/A|0:00|JobHeldUser",
            "103|sort|PENDING|alice|short|4294||2021-10-07T11:14:49|N/A|N/A|0:00|Dependency",
            "104|old|CANCELLED|alice|short|4294|node02|2021-10-07T11:00:00|2021-10-07T11:01:00|2021-10-07T11:02:00|1:00|None",
            "slurm_load_jobs error: Invalid job id specified",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let entries = parse_status_lines(&SlurmAdapter, &lines);
        assert_eq!(entries.len(), 4);

        let running = &entries["101"];
        assert_eq!(running.state, JobState::Running);
        assert_eq!(running.info.host.as_deref(), Some("node01"));
        assert_eq!(running.info.wall_time, Some(Duration::from_secs(94)));
        assert!(running.info.start_time.is_some());

        assert_eq!(entries["102"].state, JobState::Hold);
        assert_eq!(entries["102"].info.host, None);
        assert_eq!(entries["102"].info.start_time, None);
        assert_eq!(entries["103"].state, JobState::Queued);
        assert_eq!(entries["104"].state, JobState::Aborted);
    }

    #[test]
    fn status_and_control_commands() {
        let ids = vec!["1".to_string(), "2".to_string()];
        assert_eq!(
            SlurmAdapter
                .build_status_command(&StatusScope::Jobs(ids.clone()))
                .unwrap()
                .command_line(),
            "squeue --noheader --states=all --format=%i|%j|%T|%u|%P|%Q|%N|%V|%S|%e|%M|%r --jobs=1,2"
        );
        assert_eq!(
            SlurmAdapter.build_release_command(&ids).unwrap().command_line(),
            "scontrol release 1,2"
        );
        assert_eq!(
            SlurmAdapter.build_abort_command(&ids).unwrap().command_line(),
            "scancel 1 2"
        );
    }
}
