use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use shelfcrab::admin::format_stats;
use shelfcrab::frontend::BuiltinCommands;
use shelfcrab::store::MemoryConnector;
use shelfcrab::{Config, Gateway, Server};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const APP_NAME: &str = "🦀 shelfcrab";

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = setup().await {
        eprintln!("{APP_NAME}: {e}");
        return ExitCode::FAILURE;
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{APP_NAME} failed: {e}");
            ExitCode::FAILURE
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Setup -----------------------------------------------------------------

async fn setup() -> Result<(), shelfcrab::config::ConfigError> {
    // This has to be the first thing we do, because it initializes the config
    Config::init().await?;

    init_tracing();
    Ok(())
}

fn init_tracing() {
    let config = Config::snapshot();
    let filter = EnvFilter::try_new(config.log_level.as_str())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

// -----------------------------------------------------------------------------
// ----- Run -------------------------------------------------------------------

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::snapshot();
    let settings = config.settings;

    let gateway = Gateway::start(MemoryConnector::new(), settings.gateway).await?;
    let gateway = Arc::new(gateway);
    let commands = Arc::new(BuiltinCommands::new(config.users.clone()));

    let server = Server::bind(config.listen_addr, gateway, commands, settings.server).await?;
    info!("{} listening on {}", APP_NAME, server.local_addr()?);

    let stats = server
        .run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("{} stopped; final report:\n{}", APP_NAME, format_stats(&stats, "\n"));
    Ok(())
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
