use itertools::Itertools;

use crate::Map;
use crate::backend::{BackendAdapter, StatusEntry};

/// Values that status outputs print in place of missing data.
const MISSING_VALUE_TOKENS: [&str; 5] = ["", "-", "--", "N/A", "(null)"];

pub fn is_missing_value(value: &str) -> bool {
    MISSING_VALUE_TOKENS.contains(&value)
}

/// Returns the leading token of a status line if it looks like a job identifier: a run of
/// digits, optionally followed by an array index (`12[3]`, `12_3`) or a server suffix
/// (`12.server`).
pub fn leading_job_id<'a>(line: &'a str, delimiter: &str) -> Option<&'a str> {
    let line = line.trim_start();
    let end = line
        .find(|c: char| c.is_whitespace() || delimiter.contains(c))
        .unwrap_or(line.len());
    let token = &line[..end];
    let digits = token.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    match token[digits..].chars().next() {
        None | Some('.') | Some('[') | Some('_') => Some(token),
        Some(_) => None,
    }
}

/// Collapses whitespace runs of a status line into single spaces and splits it into columns.
pub fn split_status_line(line: &str, delimiter: &str) -> Vec<String> {
    let normalized = line.split_whitespace().join(" ");
    normalized
        .split(delimiter)
        .map(|field| field.trim().to_string())
        .collect()
}

/// Parses a bulk status report. Lines that do not start with a job identifier (headers,
/// separators, blank lines, error messages) are skipped, as are lines the adapter cannot parse.
pub fn parse_status_lines<A: BackendAdapter + ?Sized>(
    adapter: &A,
    lines: &[String],
) -> Map<String, StatusEntry> {
    let delimiter = adapter.field_delimiter();
    let mut entries = Map::default();
    for line in lines {
        if leading_job_id(line, delimiter).is_none() {
            continue;
        }
        let fields = split_status_line(line, delimiter);
        let fields: Vec<&str> = fields.iter().map(|field| field.as_str()).collect();
        match adapter.parse_status_fields(&fields) {
            Some(entry) => {
                entries.insert(entry.id.clone(), entry);
            }
            None => log::trace!("Skipping status line `{line}`"),
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::{is_missing_value, leading_job_id, parse_status_lines, split_status_line};
    use crate::backend::{
        BackendAdapter, BackendType, StateTokenTable, StatusEntry, StatusScope, SubmitRequest,
    };
    use crate::execution::{ExecCommand, ExecutionResult};
    use crate::job::id::JobId;
    use crate::job::result::JobInfo;
    use crate::job::state::JobState;
    use crate::resources::{ParameterFragment, ResourceRenderer};
    use std::time::Duration;

    const STATES: StateTokenTable = StateTokenTable {
        queued: &["PEND"],
        running: &["RUN"],
        ..StateTokenTable::EMPTY
    };

    /// Whitespace separated `<id> <name> <state> <user>` lines.
    struct ColumnAdapter;

    impl ResourceRenderer for ColumnAdapter {
        fn render_queue(&self, _queue: &str) -> Option<ParameterFragment> {
            None
        }
        fn render_memory(&self, _kilobytes: u64) -> Option<ParameterFragment> {
            None
        }
        fn render_cores(&self, _cores: u32) -> Option<ParameterFragment> {
            None
        }
        fn render_nodes(&self, _nodes: u32) -> Option<ParameterFragment> {
            None
        }
        fn format_walltime(&self, walltime: &Duration) -> String {
            walltime.as_secs().to_string()
        }
        fn render_walltime(&self, _walltime: &str) -> Option<ParameterFragment> {
            None
        }
    }

    impl BackendAdapter for ColumnAdapter {
        fn backend_type(&self) -> BackendType {
            BackendType::Lsf
        }
        fn hold_jobs_by_default(&self) -> bool {
            false
        }
        fn build_submit_command(&self, _request: &SubmitRequest) -> crate::Result<ExecCommand> {
            Ok(ExecCommand::new("submit"))
        }
        fn parse_submission(&self, _result: &ExecutionResult) -> anyhow::Result<JobId> {
            Ok(JobId::backend("1"))
        }
        fn build_status_command(&self, _scope: &StatusScope) -> crate::Result<ExecCommand> {
            Ok(ExecCommand::new("status"))
        }
        fn state_tokens(&self) -> &StateTokenTable {
            &STATES
        }
        fn parse_status_fields(&self, fields: &[&str]) -> Option<StatusEntry> {
            let &[id, name, state, user, ..] = fields else {
                return None;
            };
            Some(StatusEntry {
                id: id.to_string(),
                state: STATES.resolve(state),
                info: JobInfo {
                    description: Some(name.to_string()),
                    user: Some(user.to_string()),
                    ..Default::default()
                },
            })
        }
        fn build_release_command(&self, _ids: &[String]) -> crate::Result<ExecCommand> {
            Ok(ExecCommand::new("release"))
        }
        fn build_abort_command(&self, _ids: &[String]) -> crate::Result<ExecCommand> {
            Ok(ExecCommand::new("abort"))
        }
    }

    #[test]
    fn parse_bulk_status_skips_noise() {
        let lines: Vec<String> = ["123   myjob  RUN user1 ...", "", "not-a-job-line", "45 short"]
            .iter()
            .map(|line| line.to_string())
            .collect();
        let entries = parse_status_lines(&ColumnAdapter, &lines);
        assert_eq!(entries.len(), 1);
        let entry = &entries["123"];
        assert_eq!(entry.state, JobState::Running);
        assert_eq!(entry.info.description.as_deref(), Some("myjob"));
        assert_eq!(entry.info.user.as_deref(), Some("user1"));
    }

    #[test]
    fn accept_numeric_leading_token() {
        assert_eq!(leading_job_id("123 myjob RUN", " "), Some("123"));
        assert_eq!(leading_job_id("  42.server x", " "), Some("42.server"));
        assert_eq!(leading_job_id("7[1] x", " "), Some("7[1]"));
        assert_eq!(leading_job_id("8_2|x", "|"), Some("8_2"));
        assert_eq!(leading_job_id("15|name|RUNNING", "|"), Some("15"));
    }

    #[test]
    fn reject_other_lines() {
        assert_eq!(leading_job_id("", " "), None);
        assert_eq!(leading_job_id("Job id Name User", " "), None);
        assert_eq!(leading_job_id("----- -----", " "), None);
        assert_eq!(leading_job_id("not-a-job-line", " "), None);
        assert_eq!(leading_job_id("12abc x", " "), None);
    }

    #[test]
    fn collapse_whitespace() {
        assert_eq!(
            split_status_line("1   a \t b", " "),
            vec!["1", "a", "b"]
        );
        assert_eq!(
            split_status_line("1|Oct  19   10:00 |-", "|"),
            vec!["1", "Oct 19 10:00", "-"]
        );
    }

    #[test]
    fn missing_values() {
        assert!(is_missing_value("-"));
        assert!(is_missing_value("N/A"));
        assert!(!is_missing_value("0"));
    }
}
