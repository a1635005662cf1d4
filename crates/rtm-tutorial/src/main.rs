//! rtm-tutorial entry point.
//!
//! ```text
//! main()
//!  └─ load_config()           -- TOML file, defaults when absent
//!  └─ Client::connect()       -- TCP + application key
//!  └─ app::run()
//!       ├─ handshake_and_authenticate (optional)
//!       ├─ subscribe
//!       └─ publish → wait for ack → wait for echo → pause, repeated
//! ```

use std::path::PathBuf;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rtm_core::Client;
use rtm_tutorial::app::{self, TutorialHandler};
use rtm_tutorial::config::{load_config, DEFAULT_CONFIG_FILE};

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    // Initialise structured logging.  RUST_LOG wins over the config file.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        endpoint = %config.connection.endpoint,
        app_key = %config.connection.app_key,
        "client config"
    );
    match config.credentials() {
        Some(credentials) => info!("authenticate? yes (as {})", credentials.role),
        None => info!("authenticate? no"),
    }

    let mut client = Client::connect(
        &config.connection.endpoint,
        &config.connection.app_key,
        TutorialHandler::default(),
    )
    .context("failed to connect")?
    .with_options(config.client_options());
    info!("connected to {}", config.connection.endpoint);

    let result = app::run(&mut client, &config);
    client.close();

    let cycles = result?;
    info!("finished after {cycles} cycles");
    Ok(())
}
