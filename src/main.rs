use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use benchaway::config;
use benchaway::queue::QueueClient;
use benchaway::storage::Gateway;
use benchaway::worker::{Worker, WorkerConfig};

/// Runs the benchmark dispatcher's worker: binds the durable consumer for a
/// namespace's submit stream and processes jobs one at a time until
/// interrupted.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "benchaway.toml")]
    config: PathBuf,
}

async fn do_main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = config::load(&args.config).context("loading worker config")?;

    let gateway = match &config.queue_name {
        Some(queue_name) => Gateway::connect_with_queue(&config.nats_url, &config.namespace, queue_name).await,
        None => Gateway::connect(&config.nats_url, &config.namespace).await,
    }
    .context("connecting to storage backend")?;

    gateway.init_schema().await.context("initializing schema")?;

    let queue = QueueClient::new(gateway.clone(), config.consumer_name.clone());
    let worker = Worker::new(
        queue,
        gateway,
        WorkerConfig {
            jobs_dir: config.jobs_dir.clone(),
            git_remote_allowlist: config.git_remote_allowlist.clone(),
            toolchain_path: config.toolchain_path.clone(),
            worker_version: env!("CARGO_PKG_VERSION").to_owned(),
        },
    );

    let cancel = CancellationToken::new();
    let watcher_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("received interrupt, finishing the current job then stopping");
        watcher_cancel.cancel();
    });

    worker.run(cancel).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    do_main().await
}
