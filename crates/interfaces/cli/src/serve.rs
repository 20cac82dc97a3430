use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

use conductor_config::AppConfig;
use conductor_runtime::{Runtime, SocketGateway};

pub(crate) async fn run_gateway(config: AppConfig) -> Result<()> {
    let socket_path = config.gateway.socket_path.clone();
    let gateway = SocketGateway::new();
    let runtime = Runtime::build(config, gateway.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(
        gateway
            .clone()
            .serve(socket_path.clone(), runtime.dispatcher.clone(), shutdown_rx),
    );

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c().await?;
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = &mut server => {
            runtime.shutdown();
            return result?;
        }
        result = terminate => {
            result?;
        }
    }

    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    runtime.shutdown();
    server.await??;
    Ok(())
}
