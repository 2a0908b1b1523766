mod entities;
mod errors;
mod jobs;
mod provider;
mod session;
mod settings;
mod storage;
mod tokens;
mod web;

use clap::Parser;
use migration::MigratorTrait;
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "trellis",
    version,
    about = "Platform configurator backend: CLI device auth and cluster liveness"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    if settings.auth.jwt_secret.is_none() {
        tracing::warn!(
            "No CLI JWT secret configured (auth.jwt_secret / CLI_JWT_SECRET); \
             token endpoints will answer with configuration errors"
        );
    }

    // init storage (database) and bring the schema up to date
    let db = storage::init(&settings.database).await?;
    migration::Migrator::up(&db, None).await.into_diagnostic()?;

    // background cleanup of expired sessions and device logins
    let _scheduler = jobs::init_scheduler(db.clone()).await?;

    // start web server
    web::serve(settings, db).await?;
    Ok(())
}
