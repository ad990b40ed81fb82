use graphmcp::{config::GatewayConfig, logging, Gateway};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    logging::init(logging::LogFormat::from_env());

    let config = GatewayConfig::from_env()?;
    let bind_address = config.bind_address();
    info!(
        backend = %config.backend_url,
        require_auth = config.require_auth,
        rate_limit = config.rate_limit.is_some(),
        max_sessions = config.max_sessions,
        "Configuration loaded"
    );

    let gateway = match Gateway::from_config(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "Failed to start gateway");
            return Err(e.into());
        }
    };

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    let report = gateway.serve(listener, shutdown_signal()).await?;

    if report.forced {
        error!(
            in_flight = report.in_flight,
            "Shutdown timed out with requests still running"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
