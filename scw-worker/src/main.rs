// Shader compile worker entry point
use anyhow::{Context, Result};
use clap::Parser;
use scw_core::{WorkerConfig, WorkerContext};
use scw_worker::fatal::{self, FatalChannel};
use scw_worker::logging;
use scw_worker::worker::{ExitReason, SystemHost, Worker, WorkerArgs};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "ShaderCompileWorker")]
#[command(about = "Compiles batched shader jobs handed over by an engine process")]
#[command(version)]
struct Cli {
    /// Directory shared with the parent process
    working_dir: PathBuf,

    /// Parent process id, 0 to run without a parent
    parent_pid: u32,

    /// Worker thread id of the parent (cosmetic)
    thread_id: String,

    /// Batch input file name inside the working directory
    input_file: String,

    /// Batch output file name inside the working directory
    output_file: String,

    /// Settings file (default: ShaderCompileWorker.json next to the executable)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load_config(explicit: Option<&Path>, exe_dir: &Path) -> Result<WorkerConfig> {
    match explicit {
        Some(path) => WorkerConfig::load_from(path),
        None => WorkerConfig::load(exe_dir),
    }
}

fn executable_dir() -> Result<PathBuf> {
    let exe_path: PathBuf = std::env::current_exe().context("Failed to locate worker executable")?;
    exe_path
        .parent()
        .map(Path::to_path_buf)
        .context("Worker executable has no parent directory")
}

fn main() {
    let cli = Cli::parse();
    let args = WorkerArgs {
        working_dir: cli.working_dir,
        parent_pid: cli.parent_pid,
        thread_id: cli.thread_id,
        input_file: cli.input_file,
        output_file: cli.output_file,
    };
    // Until the settings are loaded, failures use the default exit delay.
    let startup = FatalChannel::new(args.output_path(), WorkerConfig::default().fatal_exit_delay());

    let exe_dir: PathBuf = match executable_dir() {
        Ok(dir) => dir,
        Err(e) => startup.report(0, &format!("{:#}", e)),
    };
    let config: WorkerConfig = match load_config(cli.config.as_deref(), &exe_dir) {
        Ok(config) => config,
        Err(e) => startup.report(0, &format!("{:#}", e)),
    };
    let channel = FatalChannel::new(args.output_path(), config.fatal_exit_delay());

    if let Err(e) = logging::init(&args.working_dir, &args.input_file, &config) {
        channel.report(0, &format!("{:#}", e));
    }
    fatal::install_panic_hook();
    log::info!(
        "Worker {} started in {} (parent {}, input {}, output {})",
        args.thread_id,
        args.working_dir.display(),
        args.parent_pid,
        args.input_file,
        args.output_file
    );

    let context = WorkerContext::new(config, &exe_dir, args.working_dir.clone());
    let mut worker = Worker::new(args, context, SystemHost);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.run()));
    let job_in_flight: i32 = worker.context().job_in_flight;
    let reason: ExitReason = match outcome {
        Ok(Ok(reason)) => reason,
        Ok(Err(e)) => channel.report(job_in_flight, &e.to_string()),
        Err(payload) => channel.report(job_in_flight, &fatal::crash_message(&*payload)),
    };

    log::info!(
        "Served {} batches, exiting ({:?})",
        worker.batches_served(),
        reason
    );
    log::logger().flush();
}
