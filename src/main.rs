use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dreampics::app::App;
use dreampics::cloud::{Ec2Provider, LaunchTemplate};
use dreampics::config::Settings;
use dreampics::datastore::Store;
use dreampics::queue::{self, TaskQueue};
use dreampics::storage::FsStorage;
use dreampics::worker::HttpWorkerClient;
use dreampics::{job, shutdown, web};

#[derive(Parser, Debug)]
#[command(name = "dreampics")]
#[command(about = "Processes uploaded images on short-lived EC2 dream servers")]
struct Args {
    /// Port for the HTTP front-end
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Root directory for stored images
    #[arg(long, default_value = "data")]
    storage_root: PathBuf,

    /// Seconds between pool shrink sweeps
    #[arg(long, default_value = "300")]
    shrink_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::from_env()?;

    let (task_queue, task_receiver) = TaskQueue::channel();
    let store = Arc::new(Store::new(Arc::new(task_queue.clone())));
    let cloud = Arc::new(Ec2Provider::new(&settings).await);
    let storage = Arc::new(FsStorage::new(
        args.storage_root,
        settings.storage_bucket.clone(),
    ));

    let app = Arc::new(App {
        store,
        cloud,
        storage,
        worker: Arc::new(HttpWorkerClient::new()),
        launch: LaunchTemplate::from_settings(&settings),
        liveness_probe_delay: Duration::from_secs(5),
    });

    tracing::info!(
        region = %settings.aws_region,
        ami = %settings.dream_server_ami,
        instance_type = %settings.dream_server_instance_type,
        bucket = %settings.storage_bucket,
        "Starting dreampics"
    );

    let shutdown = shutdown::Shutdown::listen()?;

    tokio::spawn(queue::run_dispatcher(
        app.clone(),
        task_receiver,
        task_queue,
        shutdown.subscribe(),
    ));
    tokio::spawn(job::pool::run_shrink_loop(
        app.store.clone(),
        Duration::from_secs(args.shrink_interval_secs),
        shutdown.subscribe(),
    ));

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    web::serve(addr, app, shutdown.subscribe()).await?;

    Ok(())
}
