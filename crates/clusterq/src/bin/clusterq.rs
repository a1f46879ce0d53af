use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;

use clusterq::common::config::JobManagerOptions;
use clusterq::common::setup::setup_logging;
use clusterq::common::utils::time::parse_hms_or_human_time;
use clusterq::{
    BackendType, JobContext, JobDefinitionBuilder, JobLog, JobManager, JobResult, JobState,
    LocalExecutor, Memory, ResourceSet, create_adapter,
};

#[derive(Parser)]
#[command(author, version = clusterq::CLUSTERQ_VERSION, about)]
struct RootOptions {
    /// Turn on a more detailed log output
    #[arg(long, global = true, env = "CLUSTERQ_DEBUG")]
    debug: bool,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser)]
enum SubCommand {
    /// Submit a job and print its submission result as JSON
    Submit(SubmitOpts),
}

#[derive(Parser)]
struct SubmitOpts {
    /// Backend that receives the job
    #[arg(long, env = "CLUSTERQ_BACKEND")]
    backend: BackendType,

    /// Name of the job
    #[arg(long, default_value = "clusterq-job")]
    name: String,

    /// Accounting project of the job
    #[arg(long)]
    account: Option<String>,

    /// Inline shell script executed by the job
    #[arg(long, conflicts_with = "tool", required_unless_present = "tool")]
    script: Option<String>,

    /// Path to an executable executed by the job
    #[arg(long)]
    tool: Option<PathBuf>,

    /// Queue (partition) of the job
    #[arg(long)]
    queue: Option<String>,

    /// Requested memory, e.g. `512m` or `4g`
    #[arg(long)]
    memory: Option<Memory>,

    /// Requested cores
    #[arg(long)]
    cores: Option<u32>,

    /// Requested nodes
    #[arg(long)]
    nodes: Option<u32>,

    /// Walltime limit, `HH:MM:SS` or humantime (`2h 30m`)
    #[arg(long, value_parser = parse_hms_or_human_time)]
    walltime: Option<Duration>,

    /// Environment variable passed to the job (`KEY=VALUE`), can be used multiple times
    #[arg(long = "env", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Raw argument appended to the submission command, can be used multiple times
    #[arg(long = "extra-arg", allow_hyphen_values = true)]
    extra_args: Vec<String>,

    /// Working directory of the job
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// File that receives both stdout and stderr of the job. Output is discarded if not set
    #[arg(long)]
    log: Option<PathBuf>,

    /// TOML file with job manager options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Submit the job in a held state
    #[arg(long)]
    hold: bool,

    /// Wait until the job finishes
    #[arg(long)]
    wait: bool,

    /// How often is the job status checked while waiting
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    wait_interval: Duration,
}

fn parse_key_value(text: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = text
        .split_once('=')
        .with_context(|| format!("Expected KEY=VALUE, got `{text}`"))?;
    Ok((key.to_string(), value.to_string()))
}

#[derive(Serialize)]
struct SubmitOutput {
    result: JobResult,
    state: JobState,
}

async fn command_submit(opts: SubmitOpts) -> anyhow::Result<()> {
    let mut options = match &opts.config {
        Some(path) => JobManagerOptions::from_file(path)?,
        None => JobManagerOptions::default(),
    }
    .with_env_overrides();
    if opts.hold {
        options.hold_jobs = Some(true);
    }
    let manager = JobManager::new(
        create_adapter(opts.backend),
        Arc::new(LocalExecutor::new()),
        options,
    );

    let mut definition = JobDefinitionBuilder::default()
        .name(opts.name)
        .resources(ResourceSet {
            queue: opts.queue,
            memory: opts.memory,
            cores: opts.cores,
            nodes: opts.nodes,
            walltime: opts.walltime,
        })
        .parameters(opts.env.into_iter().collect())
        .extra_args(opts.extra_args)
        .log(opts.log.map(JobLog::Joined).unwrap_or(JobLog::Discard));
    if let Some(script) = opts.script {
        definition = definition.script(script);
    }
    if let Some(tool) = opts.tool {
        definition = definition.tool(tool);
    }
    if let Some(account) = opts.account {
        definition = definition.accounting_name(account);
    }
    if let Some(cwd) = opts.cwd {
        definition = definition.working_dir(cwd);
    }
    let job = JobContext::new().create_job(definition.build()?)?;

    let result = manager.run_job(&job).await?;
    if opts.wait && result.successful {
        if manager.holds_jobs() {
            manager.start_held_jobs(std::slice::from_ref(&job)).await?;
        }
        let state = manager.wait_for_job(&job, opts.wait_interval).await?;
        log::debug!("Job {} finished as {state}", result.job_id);
    }

    let output = SubmitOutput {
        result,
        state: job.state(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> clusterq::Result<()> {
    let opts = RootOptions::parse();
    setup_logging(opts.debug);

    let result = match opts.subcmd {
        SubCommand::Submit(opts) => command_submit(opts).await,
    };

    if let Err(error) = result {
        log::error!("{error:?}");
        std::process::exit(1);
    }

    Ok(())
}
