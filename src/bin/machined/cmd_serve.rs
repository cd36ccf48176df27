use std::sync::Arc;

use anyhow::Result;
use machine_dispatch::{Address, Config, Dispatcher, JsonRpc, Listener};

pub async fn main(config: &Config, address: Option<&Address>) -> Result<()> {
    let address = address.unwrap_or(&config.server.address);

    // Bound first so a second instance fails before touching any machine.
    let listener = Arc::new(address.listen().await?);

    let dispatcher = Dispatcher::new();
    dispatcher.connect_machines(config).await;
    tracing::info!(address = %address, "serving");

    let accepting = {
        let listener = listener.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { accept_clients(&listener, &dispatcher).await })
    };

    if let Err(error) = handle_signals().await {
        tracing::error!(error = format!("{:?}", error), "signal handling failed; shutting down");
    }

    tracing::info!("triggering cleanup...");
    listener.stop();
    if let Err(error) = accepting.await {
        tracing::warn!(error = format!("{:?}", error), "accept loop ended abnormally");
    }
    listener.cleanup();
    dispatcher.shutdown().await;
    tracing::info!("all clean, exiting!");

    Ok(())
}

async fn accept_clients(listener: &Listener, dispatcher: &Arc<Dispatcher>) {
    while let Some(connection) = listener.accept().await {
        let engine = JsonRpc::new(connection);
        dispatcher.register(&engine);
        tracing::debug!("client connected");
        tokio::spawn(engine.run());
    }
}

async fn handle_signals() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGINT handler");
            e
        })?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGTERM handler");
            e
        })?;

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await.map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up Ctrl+C handler");
            anyhow::Error::new(e)
        })?;

        tracing::info!("received Ctrl+C (SIGINT)");
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use machine_dispatch::TransportError;
    use testresult::TestResult;

    use super::*;

    #[tokio::test]
    async fn test_second_instance_leaves_machines_alone() -> TestResult {
        let machine_port = portpicker::pick_unused_port().ok_or("no port available")?;
        let machine: Address = format!("tcp:127.0.0.1:{}", machine_port).parse()?;
        let machine_listener = machine.listen().await?;

        let path = std::env::temp_dir().join(format!("machined-{}.socket", uuid::Uuid::new_v4().simple()));
        let address: Address = format!("pipe:{}", path.display()).parse()?;
        let running = address.listen().await?;

        let config = Config::from_str(&format!(
            r#"
            [machines.bench]
            address = "{}"
        "#,
            machine
        ))?;
        let error = main(&config, Some(&address)).await.err().ok_or("second instance should fail")?;
        assert!(matches!(
            error.downcast_ref::<TransportError>(),
            Some(TransportError::AlreadyRunning(_))
        ));

        // The machine never saw a connection attempt.
        assert!(tokio::time::timeout(Duration::from_millis(200), machine_listener.accept())
            .await
            .is_err());

        running.stop();
        running.cleanup();
        machine_listener.stop();
        Ok(())
    }
}
