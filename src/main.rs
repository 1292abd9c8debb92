mod artifacts;
mod cli;
mod config;
mod controller;
mod dispatcher;
mod error;
mod executor;
mod queue;
mod server;
mod state_machine;
mod store;
#[cfg(test)]
mod testing;
mod ui;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use artifacts::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
use cli::{Cli, Command};
use config::StoryreelConfig;
use controller::JobController;
use dispatcher::StepDispatcher;
use executor::MockStepExecutor;
use queue::ChannelQueue;
use state_machine::{InitOutcome, JobConfig, JobSummary, Step};
use store::{FileJobStore, JobStore, MemoryJobStore};

/// Controller and dispatcher wired to one queue, with the consumer running.
struct Pipeline {
    controller: Arc<JobController>,
    dispatcher: Arc<StepDispatcher>,
    cancel: CancellationToken,
    consumer: JoinHandle<()>,
}

impl Pipeline {
    fn start(
        config: &StoryreelConfig,
        store: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let (queue, receiver) = ChannelQueue::new(config.queue_capacity);
        let queue = Arc::new(queue);
        let controller = Arc::new(JobController::new(store, queue.clone()));
        let dispatcher = Arc::new(StepDispatcher::new(
            controller.clone(),
            Arc::new(MockStepExecutor::new(artifacts)),
            queue,
            config.max_delivery_attempts,
        ));

        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(
            dispatcher
                .clone()
                .run(receiver, config.workers, cancel.clone()),
        );

        Self {
            controller,
            dispatcher,
            cancel,
            consumer,
        }
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.consumer.await {
            tracing::error!(error = %e, "Dispatcher task ended abnormally");
        }
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match (&cli.command, cli.verbose) {
        (_, true) => "storyreel=debug,tower_http=debug",
        (Command::Serve { .. }, false) => "storyreel=info,tower_http=info",
        (_, false) => "storyreel=warn",
    };
    init_tracing(default_filter);

    let mut config = StoryreelConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await
        }
        Command::Run {
            prompt,
            job_id,
            images,
            file,
            in_memory,
        } => {
            let mut job_config = match file {
                Some(path) => read_job_config(&path)?,
                None => JobConfig::default(),
            };
            if let Some(prompt) = prompt {
                job_config.story.prompt = prompt;
            }
            if let Some(images) = images {
                job_config.images.count = images;
            }
            let job_id = job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            run(config, job_id, job_config, in_memory).await
        }
        Command::Status { job_id } => {
            let store = FileJobStore::open(&config.data_dir).await?;
            match store.get(&job_id).await? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => bail!("No job found with id {job_id} in {}", config.data_dir.display()),
            }
            Ok(())
        }
        Command::Steps => {
            for step in Step::ALL {
                println!("{}. {step}", step.position() + 1);
            }
            Ok(())
        }
    }
}

fn read_job_config(path: &Path) -> Result<JobConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading job config {}", path.display()))?;
    let config = serde_json::from_str(&contents)
        .with_context(|| format!("parsing job config {}", path.display()))?;
    Ok(config)
}

async fn serve(config: StoryreelConfig) -> Result<()> {
    let store = Arc::new(FileJobStore::open(&config.data_dir).await?);
    let artifacts = Arc::new(FsArtifactStore::new(&config.artifact_dir));
    let pipeline = Pipeline::start(&config, store, artifacts);

    let app = server::router(
        server::AppState {
            controller: pipeline.controller.clone(),
            dispatcher: pipeline.dispatcher.clone(),
        },
        config.request_timeout(),
    );

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(
        %addr,
        data_dir = %config.data_dir.display(),
        artifact_dir = %config.artifact_dir.display(),
        "storyreel listening",
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, draining dispatcher");
    pipeline.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

/// Run one job to a terminal state, showing progress in the terminal.
async fn run(
    config: StoryreelConfig,
    job_id: String,
    job_config: JobConfig,
    in_memory: bool,
) -> Result<()> {
    let store: Arc<dyn JobStore>;
    let artifacts: Arc<dyn ArtifactStore>;
    if in_memory {
        store = Arc::new(MemoryJobStore::new());
        artifacts = Arc::new(MemoryArtifactStore::new());
    } else {
        store = Arc::new(FileJobStore::open(&config.data_dir).await?);
        artifacts = Arc::new(FsArtifactStore::new(&config.artifact_dir));
    }
    let pipeline = Pipeline::start(&config, store, artifacts);

    let outcome = pipeline.controller.init(&job_id, Some(job_config)).await?;
    if let InitOutcome::AlreadyRunning(_) = outcome {
        pipeline.shutdown().await;
        bail!("Job {job_id} is already running");
    }

    let mut progress = ui::JobProgress::start(&job_id);
    let controller = pipeline.controller.clone();
    let polled = tokio::time::timeout(config.run_timeout(), async {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            ticker.tick().await;
            let state = controller.status(&job_id).await?;
            progress.update(&state);
            if state.status.is_terminal() {
                return Ok::<_, error::PipelineError>(state);
            }
        }
    })
    .await;
    pipeline.shutdown().await;

    let state = match polled {
        Ok(state) => state?,
        Err(_) => bail!(
            "Job {job_id} did not finish within {}s; check `storyreel status {job_id}`",
            config.run_timeout_secs
        ),
    };

    progress.finish(&state);
    progress.print_summary(&JobSummary::from_state(&state));

    if state.status == state_machine::JobStatus::Failed {
        bail!("Job {job_id} failed");
    }
    Ok(())
}
