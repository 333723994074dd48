use std::str::FromStr;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use compression_tasker::config::Config;
use compression_tasker::llm::openrouter::OpenRouterGateway;
use compression_tasker::prelude::*;
use compression_tasker::repository::Repository;
use compression_tasker::{admin_seeder, db, tasker};

/// Evaluate prompt-compression attempts against a corpus of stored tests.
///
/// All configuration is read from the environment (see `.env.example`);
/// this binary takes no arguments of its own beyond `--help`/`--version`.
#[derive(Debug, Parser)]
#[clap(version, author)]
struct Opts {}

#[tokio::main]
async fn main() -> Result<()> {
    let directive = Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    real_main().await
}

#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _opts = Opts::parse();

    let config = Config::from_env().context("failed to load configuration")?;

    let pool = db::connect(&config.db).await?;
    let repo = Repository::new(pool);

    admin_seeder::seed_admin(
        &repo,
        &config.admin_seed.login,
        &config.admin_seed.email,
        &config.admin_seed.password,
        config.salt_rounds,
    )
    .await
    .context("failed to seed admin user")?;

    let gateway = OpenRouterGateway::new(&config.openrouter)?;

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, draining in-flight work");
            shutdown_for_signal.cancel();
        }
    });

    tasker::run(&repo, &gateway, config.poll_interval, shutdown).await;

    Ok(())
}
