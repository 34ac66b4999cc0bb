use std::env;

use color_eyre::Result;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};
use tunnel_operator::daemon;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    let logger_env = env::var("LOGGER").unwrap_or_else(|_| "logfmt".to_string());

    let logfmt_logger = tracing_logfmt::layer().boxed();

    let pretty_logger = tracing_subscriber::fmt::layer().pretty().boxed();

    let json_logger = tracing_subscriber::fmt::layer().json().boxed();

    let compact_logger = tracing_subscriber::fmt::layer().compact().boxed();

    let logger = match logger_env.as_str() {
        "logfmt" => logfmt_logger,
        "pretty" => pretty_logger,
        "json" => json_logger,
        "compact" => compact_logger,
        _ => logfmt_logger,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?
        .add_directive("tower=off".parse()?)
        .add_directive("hyper=error".parse()?)
        .add_directive("kube_client=info".parse()?)
        .add_directive("h2=error".parse()?)
        .add_directive("tokio_util=error".parse()?);

    let collector = Registry::default().with(logger).with(env_filter);
    tracing::subscriber::set_global_default(collector)?;

    info!("Tunnel Operator, version {}", env!("CARGO_PKG_VERSION"));
    info!("Starting up...");

    daemon::run().await
}
