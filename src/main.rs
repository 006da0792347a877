use std::sync::atomic::AtomicBool;

use tracing_subscriber::EnvFilter;

use secondlook::config::{self, Settings};
use secondlook::intake::StoreWatcher;
use secondlook::pipeline::{HttpExtractionClient, HttpReviewService, PipelineCoordinator};
use secondlook::store::FsObjectStore;
use secondlook::{db, service};

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("Secondlook starting v{}", config::APP_VERSION);

    let settings = Settings::from_env();
    if let Err(e) = run(settings) {
        tracing::error!(error = %e, "Startup failed");
        std::process::exit(1);
    }
}

fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&settings.data_dir)?;
    let objects_root = settings.data_dir.join("objects");

    let conn = db::open_database(&settings.data_dir.join("state.db"))?;
    let coordinator = PipelineCoordinator::new(
        conn,
        Box::new(FsObjectStore::new(&objects_root)?),
        Box::new(HttpExtractionClient::new(
            &settings.extraction_url,
            settings.http_timeout_secs,
        )),
        Box::new(HttpReviewService::new(
            &settings.review_url,
            settings.http_timeout_secs,
        )),
        settings.clone(),
    );

    let service = service::start(coordinator, settings.sweep_interval);
    let watcher = StoreWatcher::new(
        Box::new(FsObjectStore::new(&objects_root)?),
        service.sender(),
    );

    tracing::info!(
        data_dir = %settings.data_dir.display(),
        extraction_url = %settings.extraction_url,
        review_url = %settings.review_url,
        "Watching store for arrivals and completions"
    );

    // The watcher runs on the main thread until the process is killed;
    // persisted state resumes in-flight runs on the next start.
    let shutdown = AtomicBool::new(false);
    watcher.run(&shutdown, settings.poll_interval);

    drop(service);
    Ok(())
}
