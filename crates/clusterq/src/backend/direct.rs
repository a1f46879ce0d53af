use std::time::Duration;

use crate::backend::{
    BackendAdapter, BackendType, DependencyMode, StateTokenTable, StatusScope, SubmitRequest,
};
use crate::common::error::{configuration_error, unsupported};
use crate::common::utils::time::format_hms_duration;
use crate::execution::{ExecCommand, ExecutionResult};
use crate::job::JobCommand;
use crate::job::id::JobId;
use crate::job::state::JobState;
use crate::resources::{ParameterFragment, ResourceRenderer};

/// Runs jobs synchronously through `bash`, without any scheduler.
///
/// A job is finished once its submission returns, so there is nothing to poll, release or
/// abort. Dependencies are checked before the job is started.
#[derive(Debug, Default)]
pub struct DirectAdapter;

impl ResourceRenderer for DirectAdapter {
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
        format_hms_duration(walltime)
    }

    fn render_walltime(&self, _walltime: &str) -> Option<ParameterFragment> {
        None
    }
}

impl BackendAdapter for DirectAdapter {
    fn backend_type(&self) -> BackendType {
        BackendType::Direct
    }

    fn hold_jobs_by_default(&self) -> bool {
        false
    }

    fn dependency_mode(&self) -> DependencyMode {
        DependencyMode::PreFlight
    }

    fn requires_polling(&self) -> bool {
        false
    }

    fn build_submit_command(&self, request: &SubmitRequest) -> crate::Result<ExecCommand> {
        let job = request.job;
        let command = ExecCommand::new("bash")
            .envs(job.parameters())
            .working_dir(job.working_dir().map(|dir| dir.to_path_buf()))
            .log(job.log().clone())
            .args(job.extra_args().iter().cloned());
        Ok(match job.command() {
            JobCommand::Tool(tool) => command.arg(tool.display().to_string()),
            JobCommand::Script(script) => command.arg("-s").stdin(script.as_str()),
            JobCommand::Fake => return configuration_error("Fake jobs cannot be executed"),
        })
    }

    /// The process id of the finished process serves as the job identifier.
    fn parse_submission(&self, result: &ExecutionResult) -> anyhow::Result<JobId> {
        if result.process_id.is_empty() {
            anyhow::bail!("Missing process id of a direct job");
        }
        Ok(JobId::backend(result.process_id.as_str()))
    }

    fn state_after_submission(&self, successful: bool, _hold: bool) -> JobState {
        if successful {
            JobState::CompletedSuccessful
        } else {
            JobState::Failed
        }
    }

    fn build_status_command(&self, _scope: &StatusScope) -> crate::Result<ExecCommand> {
        unsupported("Direct backend does not report job status")
    }

    fn state_tokens(&self) -> &StateTokenTable {
        &StateTokenTable::EMPTY
    }

    fn build_release_command(&self, _ids: &[String]) -> crate::Result<ExecCommand> {
        unsupported("Direct backend cannot release jobs")
    }

    fn build_abort_command(&self, _ids: &[String]) -> crate::Result<ExecCommand> {
        unsupported("Direct backend cannot abort jobs")
    }
}

#[cfg(test)]
mod tests {
    use super::DirectAdapter;
    use crate::backend::{BackendAdapter, StatusScope, SubmitRequest};
    use crate::execution::ExecutionResult;
    use crate::job::state::JobState;
    use crate::job::{JobContext, JobDefinitionBuilder, JobLog};
    use crate::resources::{ResourceSet, translate_resources};
    use crate::{Error, JobId};

    #[test]
    fn ignore_resources() {
        let params = translate_resources(
            &ResourceSet {
                queue: Some("short".to_string()),
                cores: Some(4),
                ..Default::default()
            },
            &DirectAdapter,
        )
        .unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn run_script_through_stdin() {
        let ctx = JobContext::new();
        let job = ctx
            .create_job(
                JobDefinitionBuilder::default()
                    .name("hello")
                    .script("echo $GREETING")
                    .parameter(("GREETING".to_string(), "hi".to_string()))
                    .working_dir("/tmp")
                    .log(JobLog::Joined("/tmp/hello.log".into()))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let command = DirectAdapter
            .build_submit_command(&SubmitRequest {
                job: &job,
                parameters: &Default::default(),
                dependencies: &[],
                hold: false,
            })
            .unwrap();
        assert_eq!(command.command_line(), "bash -s");
        assert_eq!(command.stdin.as_deref(), Some("echo $GREETING"));
        assert_eq!(command.env["GREETING"], "hi");
        assert_eq!(command.working_dir.as_deref(), Some(std::path::Path::new("/tmp")));
        assert_eq!(command.log, Some(JobLog::Joined("/tmp/hello.log".into())));
    }

    #[test]
    fn finished_after_submission() {
        assert_eq!(
            DirectAdapter.state_after_submission(true, true),
            JobState::CompletedSuccessful
        );
        assert_eq!(
            DirectAdapter.state_after_submission(false, false),
            JobState::Failed
        );
        let mut result = ExecutionResult::success(vec![]);
        result.process_id = "4242".to_string();
        assert_eq!(
            DirectAdapter.parse_submission(&result).unwrap(),
            JobId::backend("4242")
        );
    }

    #[test]
    fn control_is_unsupported() {
        assert!(matches!(
            DirectAdapter.build_status_command(&StatusScope::All { user: None }),
            Err(Error::UnsupportedOperation(_))
        ));
        assert!(matches!(
            DirectAdapter.build_abort_command(&["1".to_string()]),
            Err(Error::UnsupportedOperation(_))
        ));
    }
}
