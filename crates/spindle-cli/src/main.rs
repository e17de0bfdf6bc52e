use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use spindle_core::impls::ShellExecutor;
use spindle_core::ports::{Clock, OutputChunk, SystemClock};
use spindle_core::storage::{self, Storage};
use spindle_core::{
    DlqManager, Job, JobId, JobState, SpindleConfig, StorageDriver, StorageSource, Worker, WorkerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(version)]
#[command(about = "A local job queue for shell commands, with retries and a dead-letter queue")]
#[command(propagate_version = true)]
struct Args {
    /// Storage backend (file | sqlite | memory); overrides SPINDLE_STORAGE_DRIVER
    #[arg(long, global = true)]
    driver: Option<StorageDriver>,

    /// Storage directory or database file; overrides SPINDLE_STORAGE_LOCATION
    #[arg(long, global = true)]
    location: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a job
    Enqueue {
        /// Shell command, run with `sh -c`
        command: String,

        /// Explicit job id (default: generated)
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long)]
        backoff_base: Option<u32>,

        /// Not before this RFC 3339 instant
        #[arg(long, conflicts_with = "delay_secs")]
        run_at: Option<DateTime<Utc>>,

        /// Not before now + this many seconds
        #[arg(long)]
        delay_secs: Option<u64>,
    },

    /// Run jobs until Ctrl-C
    Worker {
        #[arg(long, short = 'c')]
        concurrency: Option<usize>,

        /// Exit once nothing is due
        #[arg(long)]
        until_empty: bool,

        /// Per-job timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Hide job stdout / stderr
        #[arg(long)]
        quiet: bool,
    },

    /// Print jobs as JSON lines
    List {
        #[arg(long)]
        state: Option<JobState>,
    },

    /// Per-state counts
    Status,

    /// Dead-letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Move jobs stranded in `dead` into the DLQ
    Sweep,
}

#[derive(Subcommand, Debug)]
enum DlqCommands {
    /// Print DLQ entries as JSON lines
    List,

    /// Revive a dead job as pending with zero attempts
    Retry { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    spindle_core::observability::init_tracing();
    let args = Args::parse();

    let mut config = SpindleConfig::from_env().context("invalid SPINDLE_* environment")?;
    if let Some(driver) = args.driver {
        config.storage_driver = driver;
    }
    if let Some(location) = args.location {
        config.storage_location = location;
    }

    let storage = storage::open(&config)
        .await
        .with_context(|| format!("failed to open {} storage at {:?}", config.storage_driver, config.storage_location))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let result = run(args.command, &config, storage.clone(), clock).await;
    storage.close().await.context("failed to close storage")?;
    result
}

async fn run(
    command: Commands,
    config: &SpindleConfig,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<()> {
    match command {
        Commands::Enqueue {
            command,
            id,
            max_retries,
            backoff_base,
            run_at,
            delay_secs,
        } => {
            let now = clock.now();
            let mut options = config.job_options();
            if let Some(n) = max_retries {
                options = options.max_retries(n);
            }
            if let Some(base) = backoff_base {
                options = options.backoff_base(base);
            }
            if let Some(at) = run_at {
                options = options.run_at(at);
            }
            if let Some(secs) = delay_secs {
                let delay = chrono::Duration::try_seconds(i64::try_from(secs)?).context("delay too large")?;
                options = options.run_at(now + delay);
            }
            let job = match id {
                Some(id) => Job::create_with_id(JobId::new(id), command, options, now)?,
                None => Job::create(command, options, now)?,
            };
            storage.enqueue(job.clone()).await.context("enqueue failed")?;
            print_json(&job)?;
        }

        Commands::Worker {
            concurrency,
            until_empty,
            timeout_secs,
            quiet,
        } => {
            let mut worker_config = WorkerConfig::from_config(config).stop_when_empty(until_empty);
            if let Some(n) = concurrency {
                worker_config.concurrency = n;
            }
            let timeout = timeout_secs.map(std::time::Duration::from_secs).or(config.job_timeout());

            let mut executor = ShellExecutor::new().with_timeout(timeout);
            let printer = if quiet {
                None
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                executor = executor.with_output(tx);
                Some(tokio::spawn(print_output(rx)))
            };

            let cancel = CancellationToken::new();
            let source = StorageSource::new(storage.clone(), clock.clone());
            let handle = Worker::new(Arc::new(source), Arc::new(executor), worker_config)
                .with_cancellation(cancel.clone())
                .on_error(|err| {
                    tracing::error!(
                        job_id = ?err.job_id,
                        execution_error = ?err.execution_error,
                        error = %err.source,
                        "worker error"
                    );
                })
                .start()?;

            let signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("received Ctrl-C, finishing in-flight jobs");
                    signal.cancel();
                }
            });

            let stats = handle.join().await;
            if let Some(printer) = printer {
                // the executor (and its sender) is gone once every loop exits
                let _ = printer.await;
            }
            print_json(&stats)?;
        }

        Commands::List { state } => {
            for job in storage.list(state).await? {
                print_json(&job)?;
            }
        }

        Commands::Status => {
            print_json(&storage.counts().await?)?;
        }

        Commands::Dlq { command } => {
            let dlq = DlqManager::new(storage, clock);
            match command {
                DlqCommands::List => {
                    for job in dlq.list().await? {
                        print_json(&job)?;
                    }
                }
                DlqCommands::Retry { id } => match dlq.retry(&JobId::new(id.clone())).await? {
                    Some(job) => print_json(&job)?,
                    None => bail!("no dlq entry with id {id}"),
                },
            }
        }

        Commands::Sweep => {
            let moved = DlqManager::new(storage, clock).sweep_dead_to_dlq().await?;
            print_json(&moved)?;
        }
    }
    Ok(())
}

async fn print_output(mut rx: mpsc::UnboundedReceiver<OutputChunk>) {
    while let Some(chunk) = rx.recv().await {
        println!("[{} {}] {}", chunk.job_id, chunk.stream, chunk.line);
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
