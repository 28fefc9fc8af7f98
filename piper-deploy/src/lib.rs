pub mod logging;

/// Resolves on the first Ctrl+C
///
/// Never resolves if the signal handler can not be installed.
pub async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Detected Ctrl+c"),
        Err(error) => {
            tracing::error!("Failed to wait for Ctrl+c: {}", error);
            std::future::pending::<()>().await
        }
    }
}
