use anyhow::{Context, Result};

use thumbwheel::app::App;

/// Resolves on Ctrl-C
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }
}

/// Run the HTTP trigger and, unless disabled, the timer loop
pub async fn serve(app: &App, no_driver: bool) -> Result<()> {
    let server = app.trigger_server().context("Failed to create trigger server")?;

    println!("{}", server.info().display());
    println!();

    let handle = if no_driver {
        tracing::info!("Timer loop disabled; waiting for external triggers");
        None
    } else {
        Some(app.driver.start().context("Failed to start scheduler driver")?)
    };

    let served = server.start_with_shutdown(shutdown_signal()).await;

    if let Some(handle) = handle {
        handle.stop().await.context("Scheduler driver did not stop cleanly")?;
    }

    served.context("Trigger server failed")?;
    Ok(())
}
