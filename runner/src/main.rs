mod batch;
mod checkpoint;
mod config;
mod job;
mod lifecycle;
mod orchestrator;
mod process;
mod restart;
mod scheduler;
mod submission;
mod tools;

use crate::{
    checkpoint::{CheckpointStore, DEFAULT_IMAGE_GLOB},
    config::RunnerConfig,
    job::RunIdentity,
    orchestrator::Orchestrator,
    restart::{
        ExitCodes, RestartLoop, RestartPolicy, RunOutcome, BACKOFF_SECS, DEFAULT_BUSY_EXIT_CODE,
        DEFAULT_REQUEUE_EXIT_CODE, FAILURE_EXIT_CODE, MAX_ATTEMPTS,
    },
    scheduler::slurm::Slurm,
    tools::dmtcp::{self, Dmtcp},
};
use clap::{Args, Parser, Subcommand};
use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process::exit,
    time::Duration,
};
use tracing::{error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "requeue-runner")]
#[command(version)]
#[command(about = "Checkpoint aware submission and restart of long running slurm jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit every job of a configuration
    Submit {
        #[arg(long, short)]
        config: PathBuf,

        /// Do not ask for confirmation
        #[arg(long, short)]
        yes: bool,

        /// Print the batch scripts instead of submitting them
        #[arg(long)]
        dry: bool,
    },

    /// Print the batch script of a single job
    Render {
        #[arg(long, short)]
        config: PathBuf,

        #[arg(long, short)]
        job: String,
    },

    /// Drive one physical run of a job, called from inside the batch script
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Job name, defaults to SLURM_JOB_NAME
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    binary: PathBuf,

    #[arg(long)]
    checkpoint_dir: PathBuf,

    #[arg(long)]
    log_dir: PathBuf,

    #[arg(long, default_value = "scontrol")]
    control: String,

    #[arg(long, default_value = DEFAULT_IMAGE_GLOB)]
    image_glob: String,

    #[arg(long, default_value_t = MAX_ATTEMPTS)]
    max_attempts: u32,

    #[arg(long, default_value_t = BACKOFF_SECS)]
    backoff_secs: u64,

    #[arg(long, default_value_t = DEFAULT_BUSY_EXIT_CODE)]
    busy_exit_code: i32,

    #[arg(long, default_value_t = DEFAULT_REQUEUE_EXIT_CODE)]
    requeue_exit_code: i32,

    /// Command line starting the program under checkpoint control, one argument per flag
    #[arg(long, allow_hyphen_values = true)]
    launch: Vec<String>,

    /// Command line restarting from a checkpoint image, one argument per flag
    #[arg(long, allow_hyphen_values = true)]
    restart: Vec<String>,
}

fn load_config(path: &Path) -> RunnerConfig {
    let config = match RunnerConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config {}: {e}", path.to_string_lossy());
            exit(1)
        }
    };

    if config.preflight_checks() {
        error!("Preflight checks failed, see above");
        exit(1)
    }

    config
}

fn confirm(jobs: usize) -> bool {
    print!("Scheduling {jobs} job(s). Run? y/N ");
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
        Err(e) => {
            warn!("Failed to read answer: {e}");
            false
        }
    }
}

fn submit(config_path: &Path, yes: bool, dry: bool) -> i32 {
    let config = load_config(config_path);

    let (requests, builder, images) = match (
        config.job_requests(),
        config.script_builder(),
        config.checkpoint.matcher(),
    ) {
        (Ok(requests), Ok(builder), Ok(images)) => (requests, builder, images),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
            error!("Failed to prepare jobs: {e}");
            return 1;
        }
    };

    let scheduler = config.scheduler.slurm();
    let orchestrator =
        Orchestrator::new(&scheduler, &builder, images).threads(config.executor.threads);

    if dry {
        for (name, script) in orchestrator.dry_run(&requests) {
            println!("# {name}\n{script}");
        }

        return 0;
    }

    if !yes && !confirm(requests.len()) {
        info!("Aborted, nothing was submitted");
        return 1;
    }

    let outcomes = orchestrator.schedule(&requests);
    let failed = outcomes.iter().filter(|outcome| !outcome.is_scheduled()).count();

    if failed == 0 {
        info!("Scheduled all {} job(s)", outcomes.len());
        0
    } else {
        for outcome in outcomes.iter().filter(|outcome| !outcome.is_scheduled()) {
            error!(name = %outcome.name, "Not scheduled");
        }
        error!("{failed} of {} job(s) could not be scheduled", outcomes.len());
        1
    }
}

fn render(config_path: &Path, job: &str) -> i32 {
    let config = load_config(config_path);

    let result = config.job(job).and_then(|job| {
        let request = config.job_request(job)?;
        let builder = config.script_builder()?;
        let images = config.checkpoint.matcher()?;

        Ok((request, builder, images))
    });

    match result {
        Ok((request, builder, images)) => {
            let scheduler = config.scheduler.slurm();
            let orchestrator = Orchestrator::new(&scheduler, &builder, images);

            match orchestrator.dry_run(&[request]).pop() {
                Some((_, script)) => {
                    print!("{script}");
                    0
                }
                None => 1,
            }
        }
        Err(e) => {
            error!("Failed to render job {job}: {e}");
            1
        }
    }
}

fn run(args: RunArgs) -> i32 {
    let mut identity = match RunIdentity::from_env() {
        Ok(identity) => identity,
        Err(e) => {
            error!("Failed to determine job identity: {e}");
            return FAILURE_EXIT_CODE;
        }
    };
    if let Some(name) = args.name {
        identity.name = name;
    }

    let host = nix::unistd::gethostname()
        .map(|host| host.to_string_lossy().into_owned())
        .unwrap_or_default();
    let span = info_span!("run", host = %host, name = %identity.name);
    let _enter = span.enter();

    let store = match CheckpointStore::new(&args.checkpoint_dir, &args.image_glob) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open checkpoint store: {e}");
            return FAILURE_EXIT_CODE;
        }
    };

    let launch = if args.launch.is_empty() {
        dmtcp::default_launch()
    } else {
        args.launch
    };
    let restart = if args.restart.is_empty() {
        dmtcp::default_restart()
    } else {
        args.restart
    };

    let tool = Dmtcp::new(launch, restart, store.directory(identity.original_job_id));
    // only requeue is used from inside a job
    let scheduler = Slurm::new("sbatch", args.control, "scancel", Duration::from_secs(60));
    let codes = ExitCodes {
        busy: args.busy_exit_code,
        requeue: args.requeue_exit_code,
    };

    let report = RestartLoop::new(&store, &tool, &scheduler, args.binary, args.log_dir)
        .policy(RestartPolicy {
            max_attempts: args.max_attempts.max(1),
            backoff: Duration::from_secs(args.backoff_secs),
        })
        .codes(codes)
        .run(&identity);

    info!(
        state = %report.state(),
        attempts = report.attempts,
        "Run finished"
    );

    if let RunOutcome::Requeued(next) = &report.outcome {
        info!(
            original = %next.original_job_id,
            restart = next.restart_count,
            "Requeued, the next run continues from the checkpoint"
        );
    }

    report.exit_code(&codes)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Submit { config, yes, dry } => submit(&config, yes, dry),
        Commands::Render { config, job } => render(&config, &job),
        Commands::Run(args) => run(args),
    };

    exit(code)
}
