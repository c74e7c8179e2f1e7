use warren_client::{Session, SessionConfig};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = SessionConfig {
        address: std::env::var("WARREN_ADDR").unwrap_or_else(|_| "127.0.0.1:9481".into()),
        name: std::env::var("WARREN_NAME").unwrap_or_else(|_| "warren-cli".into()),
        ..Default::default()
    };

    tracing::info!(address = %config.address, "Connecting to warren node");
    let session = match Session::connect(config).await {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(error = %err, "Connection failed");
            std::process::exit(1);
        }
    };

    if let Some(info) = session.node_info() {
        tracing::info!(
            version = info.field(warren_proto::keys::VERSION).unwrap_or("?"),
            "Node hello received"
        );
    }

    // Print every request the node tells us about, ours or not.
    let _all = session.subscribe_all(|snapshot| {
        tracing::info!(
            id = %snapshot.id,
            kind = %snapshot.kind,
            phase = %snapshot.phase,
            succeeded = snapshot.progress.succeeded,
            total = snapshot.progress.total,
            "request update"
        );
    });

    if let Err(err) = session.list_persistent_requests().await {
        tracing::error!(error = %err, "Listing persistent requests failed");
    }

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");
    tracing::info!("Shutting down");
    session.close();
}
