//! strigil - scrape PDFs, readable text, and full-resolution images from
//! seed URLs into a local per-host layout.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (before anything else)
    let _ = dotenvy::dotenv();

    let default_filter = if strigil::cli::is_verbose() {
        "strigil=debug"
    } else {
        "strigil=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    strigil::cli::run_cli().await
}
