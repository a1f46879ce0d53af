use crate::backend::{BackendAdapter, DependencyMode, SubmitRequest};
use crate::execution::ExecCommand;
use crate::job::Job;
use crate::job::id::{JobId, unique_backend_ids};
use crate::resources::translate_resources;

/// Outcome of dependency resolution of a job that is about to be submitted.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dependencies {
    /// Backend identifiers that the backend should wait for.
    Ready(Vec<String>),
    /// A parent has not finished in a state that allows the job to start.
    Blocked { parent: String },
}

pub(crate) fn resolve_dependencies(job: &Job, mode: DependencyMode) -> Dependencies {
    match mode {
        DependencyMode::QueueMediated => {
            let ids: Vec<JobId> = job.parents().iter().filter_map(|parent| parent.id()).collect();
            Dependencies::Ready(unique_backend_ids(&ids))
        }
        DependencyMode::PreFlight => match job
            .parents()
            .iter()
            .find(|parent| !parent.state().allows_dependent_start())
        {
            Some(parent) => Dependencies::Blocked {
                parent: parent
                    .id()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| parent.name().to_string()),
            },
            None => Dependencies::Ready(Vec::new()),
        },
    }
}

/// Translates resources of the job and lets the adapter assemble the submission command.
pub(crate) fn build_submit_command(
    adapter: &dyn BackendAdapter,
    job: &Job,
    dependencies: &[String],
    hold: bool,
) -> crate::Result<ExecCommand> {
    let parameters = translate_resources(job.resources(), adapter)?;
    adapter.build_submit_command(&SubmitRequest {
        job,
        parameters: &parameters,
        dependencies,
        hold,
    })
}
