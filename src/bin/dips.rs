//! dips CLI: run workers, submit jobs, call task services.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use dips::broker::Broker;
use dips::broker::memory::MemoryBroker;
use dips::broker::pgmq::{PgmqBroker, PgmqOptions};
use dips::config::Config;
use dips::eval::SimpleEvaluator;
use dips::event::Event;
use dips::job::{JobClient, JobPoolConfig, JobWorkerPool};
use dips::model::{Job, Output, Pipeline};
use dips::mux::Multiplexer;
use dips::queues;
use dips::rpc::{NewTaskRequest, RetryPolicy, TaskClient};
use dips::sandbox::LocalContextFactory;
use dips::service::{CommandHandler, ServiceRegistry};
use dips::telemetry::{TelemetryConfig, init_telemetry};
use dips::worker::TaskWorkerPool;
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// How long buffered messages get to reach the broker on exit.
const FLUSH_GRACE: Duration = Duration::from_secs(10);
/// How long one-shot commands wait for the broker before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "dips", about = "Distributed pipeline execution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run job workers and the task services in a directory
    Serve {
        /// Directory containing service TOML definitions
        #[arg(long)]
        services: Option<PathBuf>,
        /// Concurrent jobs (defaults to DIPS_JOB_CONCURRENCY)
        #[arg(long)]
        jobs: Option<usize>,
        /// Serve task services only
        #[arg(long)]
        no_jobs: bool,
        /// Default task timeout in seconds
        #[arg(long, default_value_t = 60)]
        task_timeout: u64,
        /// Attempts per task call
        #[arg(long, default_value_t = 1)]
        attempts: u32,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Print job events as they arrive
    Events,
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a pipeline file (.json or .toml) as a job
    Submit {
        pipeline: PathBuf,
        /// Job name (defaults to the file stem)
        #[arg(long)]
        name: Option<String>,
        /// JSON object of initial variables
        #[arg(long)]
        params: Option<String>,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Call a service and print its output
    Call {
        service: String,
        /// Task name
        #[arg(long, default_value = "cli")]
        name: String,
        /// JSON object of parameters
        #[arg(long)]
        params: Option<String>,
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        #[arg(long, default_value_t = 1)]
        attempts: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "dips".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let broker = connect_broker(&config)?;
    let mux = Multiplexer::start(broker, config.mux_config());
    if !matches!(cli.command, Command::Serve { .. })
        && tokio::time::timeout(CONNECT_TIMEOUT, mux.wait_connected())
            .await
            .is_err()
    {
        mux.shutdown(Duration::ZERO).await;
        bail!("broker not reachable after {}s", CONNECT_TIMEOUT.as_secs());
    }

    let outcome = match cli.command {
        Command::Serve {
            services,
            jobs,
            no_jobs,
            task_timeout,
            attempts,
        } => {
            let pool = JobPoolConfig {
                concurrency: jobs.unwrap_or(config.job_concurrency),
                task_timeout: Duration::from_secs(task_timeout),
                retry: RetryPolicy::new(attempts, Duration::from_secs(1)),
            };
            cmd_serve(&mux, &config, services, (!no_jobs).then_some(pool)).await
        }
        Command::Job {
            action:
                JobAction::Submit {
                    pipeline,
                    name,
                    params,
                },
        } => cmd_job_submit(&mux, pipeline, name, params).await,
        Command::Task {
            action:
                TaskAction::Call {
                    service,
                    name,
                    params,
                    timeout,
                    attempts,
                },
        } => {
            let request = NewTaskRequest::new(service, name)
                .parameters(parse_object(params)?)
                .timeout(Duration::from_secs(timeout));
            cmd_task_call(&mux, request, RetryPolicy::new(attempts, Duration::from_secs(1))).await
        }
        Command::Events => cmd_events(&mux).await,
    };

    mux.shutdown(FLUSH_GRACE).await;
    outcome
}

fn connect_broker(config: &Config) -> anyhow::Result<Arc<dyn Broker>> {
    let raw = config.broker_url.expose_secret();
    let url = url::Url::parse(raw).context("DIPS_BROKER_URL is not a valid url")?;
    match url.scheme() {
        "memory" => Ok(Arc::new(MemoryBroker::new())),
        "postgres" | "postgresql" => Ok(Arc::new(PgmqBroker::new(
            SecretString::from(raw.to_string()),
            PgmqOptions::default(),
        ))),
        other => bail!("unsupported broker scheme '{other}'"),
    }
}

fn parse_object(raw: Option<String>) -> anyhow::Result<Output> {
    match raw {
        None => Ok(Output::new()),
        Some(json) => match serde_json::from_str(&json)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => bail!("parameters must be a JSON object"),
        },
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupt received, shutting down");
        trigger.cancel();
    });
    token
}

async fn cmd_serve(
    mux: &Multiplexer,
    config: &Config,
    services: Option<PathBuf>,
    jobs: Option<JobPoolConfig>,
) -> anyhow::Result<()> {
    let registry = match services {
        Some(dir) => ServiceRegistry::load_from_dir(&dir)?,
        None => ServiceRegistry::empty(),
    };
    if registry.is_empty() && jobs.is_none() {
        bail!("nothing to serve: no services and job workers disabled");
    }

    tokio::fs::create_dir_all(&config.work_dir).await?;
    let contexts = Arc::new(LocalContextFactory::new(&config.work_dir));
    let shutdown = shutdown_on_ctrl_c();
    let tracker = TaskTracker::new();

    for meta in registry.iter() {
        let pool = TaskWorkerPool::new(
            mux.clone(),
            meta.name.clone(),
            Arc::new(CommandHandler::new(meta.clone())),
            contexts.clone(),
            meta.pool_config(),
        );
        let token = shutdown.clone();
        tracker.spawn(async move {
            if let Err(e) = pool.run(token).await {
                error!(service = pool.service(), error = %e, "task service exited");
            }
        });
    }

    if let Some(jobs) = jobs {
        let pool = JobWorkerPool::new(mux.clone(), Arc::new(SimpleEvaluator), jobs);
        let token = shutdown.clone();
        tracker.spawn(async move {
            if let Err(e) = pool.run(token).await {
                error!(error = %e, "job worker pool exited");
            }
        });
    }

    tracker.close();
    tracker.wait().await;
    Ok(())
}

async fn cmd_job_submit(
    mux: &Multiplexer,
    path: PathBuf,
    name: Option<String>,
    params: Option<String>,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::load(&path)?;
    let name = match name {
        Some(name) => name,
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_string()),
    };
    let job = Job::new(name, pipeline).parameters(parse_object(params)?);
    let job_id = JobClient::new(mux).submit(job).await?;
    println!("{job_id}");
    Ok(())
}

async fn cmd_task_call(
    mux: &Multiplexer,
    request: NewTaskRequest,
    policy: RetryPolicy,
) -> anyhow::Result<()> {
    let output = TaskClient::new(mux.clone()).call(request, policy).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_events(mux: &Multiplexer) -> anyhow::Result<()> {
    let status = mux.register_consumer(queues::EVENT_STATUS);
    let message = mux.register_consumer(queues::EVENT_MESSAGE);
    let variable = mux.register_consumer(queues::EVENT_VARIABLE);
    let shutdown = shutdown_on_ctrl_c();

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            msg = status.recv() => msg,
            msg = message.recv() => msg,
            msg = variable.recv() => msg,
        };
        let Some(msg) = msg else { return Ok(()) };
        match msg.decode_payload::<Event>() {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(e) => error!(error = %e, "malformed event"),
        }
    }
}
