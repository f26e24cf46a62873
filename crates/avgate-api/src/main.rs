mod error;
mod handlers;
mod services;
mod setup;
mod state;
mod telemetry;
mod utils;

use std::sync::Arc;

use avgate_core::GateConfig;
use state::AppState;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Load configuration
    let config = GateConfig::from_env()?;
    telemetry::init_telemetry(config.log_icap_traffic);

    // Initialize the application state and routes
    let state = Arc::new(AppState::new(config.clone())?);
    let app = setup::routes::setup_routes(state);

    // Start the server
    setup::server::start_server(&config, app).await?;

    Ok(())
}
