//! rmcp-qweather: MCP server for Chinese weather forecasts
//!
//! Run with: `rmcp-qweather --apiKey=<key> [--dev]` (serves on stdio)

use rmcp::ServiceExt;
use rmcp_qweather::{WeatherConfig, WeatherServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (to stderr so it doesn't interfere with stdio transport)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = WeatherConfig::from_args(std::env::args().skip(1));
    if config.api_key.is_empty() {
        tracing::warn!("no API key supplied (--apiKey=<key>); upstream requests will be rejected");
    }
    if config.dev_mode {
        tracing::info!("using the free-subscription QWeather endpoint");
    }

    tracing::info!("Starting rmcp-qweather server");

    // Create server and serve on stdio
    let server = WeatherServer::new(config);
    let service = server.serve(rmcp::transport::stdio()).await?;

    // Wait for shutdown
    service.waiting().await?;

    tracing::info!("rmcp-qweather server stopped");
    Ok(())
}
