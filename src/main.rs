use anyhow::Result;
use evse_bridge::driver::{ChargerEngine, DriverCommand};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel::<DriverCommand>();

    let driver = ChargerEngine::new(commands_rx, commands_tx)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create driver: {}", e))?;

    info!("EvseBridge starting up");

    let web_host = driver.config().web.host.clone();
    let web_port = driver.config().web.port;
    let driver = Arc::new(Mutex::new(driver));

    let run_handle = tokio::spawn(ChargerEngine::run_on_arc(driver.clone()));

    #[cfg(feature = "web")]
    let web_handle = tokio::spawn(evse_bridge::web::serve(driver.clone(), &web_host, web_port));
    #[cfg(not(feature = "web"))]
    let _ = (web_host, web_port);

    #[cfg(feature = "web")]
    {
        tokio::select! {
            res = run_handle => {
                match res {
                    Ok(Ok(())) => info!("Driver shutdown complete"),
                    Ok(Err(e)) => {
                        error!("Driver failed with error: {}", e);
                        return Err(anyhow::anyhow!("Driver error: {}", e));
                    }
                    Err(e) => return Err(anyhow::anyhow!("Driver task panicked: {}", e)),
                }
            }
            res = web_handle => {
                match res {
                    Ok(Ok(())) => info!("Web server stopped"),
                    Ok(Err(e)) => error!("Web server failed: {}", e),
                    Err(e) => error!("Web server task panicked: {}", e),
                }
            }
        }
        Ok(())
    }

    #[cfg(not(feature = "web"))]
    {
        match run_handle.await {
            Ok(Ok(())) => {
                info!("Driver shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Driver failed with error: {}", e);
                Err(anyhow::anyhow!("Driver error: {}", e))
            }
            Err(e) => Err(anyhow::anyhow!("Driver task panicked: {}", e)),
        }
    }
}
