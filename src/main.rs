use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;

use deploy_harness::capture::GifEncoder;
use deploy_harness::config::Config;
use deploy_harness::guest::VmrunGuest;
use deploy_harness::logging;
use deploy_harness::orchestrator::{Orchestrator, OrchestratorSettings, RunIo, RunSummary};
use deploy_harness::poll::CancelToken;
use deploy_harness::store::SqliteStore;

/// Deploy Harness - regression tests for software deployment packages
#[derive(Parser, Debug)]
#[command(
    name = "deploy-harness",
    about = "Deploy packages inside a VM, verify them and revert between tests",
    after_help = "ENVIRONMENT VARIABLES:\n\
        DEPLOY_HARNESS_CONFIG          Config file path\n\
        DEPLOY_HARNESS_PASSWORD        Guest account password\n\
        DEPLOY_HARNESS_HOST_PASSWORD   Hypervisor host password\n\
        DEPLOY_HARNESS_RESULTS_DIR     Local results directory\n\
        DEPLOY_HARNESS_SHARE_DIR       Share results are published to\n\
        RUST_LOG                       Log filter (default deploy_harness=info)"
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every task assigned to the configured machine
    Run {
        /// Path to the TOML config file
        #[arg(short, long, env = "DEPLOY_HARNESS_CONFIG")]
        config: PathBuf,

        /// Write logs to a timestamped file in the log directory instead of stderr
        #[arg(short = 'f', long)]
        log_file: bool,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate config and helpers, then list the tasks that would run
    Check {
        /// Path to the TOML config file
        #[arg(short, long, env = "DEPLOY_HARNESS_CONFIG")]
        config: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run { config, log_file, json } => {
            let config = Config::load(&config)?;
            let settings = OrchestratorSettings::from_config(&config);

            let log_path = log_file.then(|| logging::log_file_path(&settings.layout.log_dir()));
            logging::init(log_path.as_deref())?;

            let cancel = CancelToken::new();
            let handler_token = cancel.clone();
            ctrlc::set_handler(move || {
                tracing::warn!("interrupt received, stopping after the current step");
                handler_token.cancel();
            })?;

            let tasks_db = SqliteStore::open(&config.database.tasks)?;
            let inventory = SqliteStore::open(&config.database.inventory)?;
            let mut sink = SqliteStore::open(&config.database.inventory)?;

            let orchestrator = Orchestrator::new(settings, cancel.clone());
            let tasks = orchestrator.preflight(&tasks_db)?;

            let mut guest = VmrunGuest::new(&config.guest.vmrun, &config.guest.vmx, config.host_connection())
                .scratch_dir(orchestrator.settings().layout.dir.join(".scratch"))
                .cancel_token(&cancel);

            let io = RunIo {
                inventory: &inventory,
                sink: &mut sink,
                encoder: &GifEncoder,
            };
            let summary = orchestrator.run(&mut guest, tasks, io)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            if let Some(reason) = &summary.aborted {
                return Err(format!("run aborted: {}", reason).into());
            }
        }

        Commands::Check { config } => {
            logging::init(None)?;
            let config = Config::load(&config)?;
            let orchestrator = Orchestrator::new(OrchestratorSettings::from_config(&config), CancelToken::new());

            let tasks_db = SqliteStore::open(&config.database.tasks)?;
            let tasks = orchestrator.preflight(&tasks_db)?;

            println!("Configuration OK for image {}", config.image_name());
            println!("{} task(s) assigned to machine {}:", tasks.len(), config.machine_id);
            for task in &tasks {
                println!("  {:>8}  {}", task.id, task.name);
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Run finished for image {}", summary.image);
    println!("  Tasks:      {} ({} deployable)", summary.tasks, summary.deployable);
    println!("  Results:    {} passed, {} failed", summary.passed, summary.failed);
    println!("  Reverts:    {}", summary.reverts);
    println!("  Retries:    {}", summary.retries);
    println!("  GIFs:       {}", summary.gifs.len());
    if summary.published > 0 {
        println!("  Published:  {} file(s)", summary.published);
    }
    if let Some(path) = &summary.recovery_file {
        println!("  Results written to recovery file {}", path.display());
    }
}
