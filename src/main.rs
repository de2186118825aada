use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use graderd::cache::DirBundleFactory;
use graderd::config::GraderConfig;
use graderd::daemon::Grader;
use graderd::dispatch::LogSink;
use graderd::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "graderd")]
#[command(version)]
#[command(about = "Grading dispatch daemon")]
struct Args {
    /// Path to the JSON configuration file. Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port for the read-only status endpoint (overrides the config file)
    #[arg(long)]
    status_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // An explicitly named config file that cannot be loaded is fatal;
    // steady-state errors on individual runs never are.
    let mut config = match &args.config {
        Some(path) => GraderConfig::load(path)?,
        None => GraderConfig::default(),
    };
    if args.status_port.is_some() {
        config.status.port = args.status_port;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let config = Arc::new(config);
    let factory = Arc::new(DirBundleFactory::new(config.cache.store_dir()));
    let grader = Grader::new(config.clone(), factory, Arc::new(LogSink));

    match grader.preload().await {
        Ok(count) => tracing::info!(bundles = count, "Input cache preloaded"),
        Err(e) => tracing::warn!(error = %e, "Input cache preload failed"),
    }

    tracing::info!(
        max_grade_retries = config.monitor.max_grade_retries,
        cache_budget_bytes = config.cache.size_bytes,
        status_port = ?config.status.port,
        "Grader started"
    );

    let shutdown = install_shutdown_handler();
    grader.run(shutdown).await;

    Ok(())
}
