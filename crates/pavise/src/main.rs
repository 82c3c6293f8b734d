//! Binary entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use pavise::{cfg::ProxyArgs, trace, Server, ServerHandle, ServerOptions};

fn main() -> Result<()> {
    let args = ProxyArgs::parse();
    let options = ServerOptions::from_args(&args)?;

    let _log_guard = trace::setup_logging(options.disable_logs, options.logs_path.as_deref())?;

    // One worker by default: every session is cooperative and the hot
    // path is byte copying, not computation.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let server = Server::bind(options).await?;
        let handle = server.handle();

        tokio::select! {
            result = server.run() => result,
            result = wait_and_close(handle) => result,
        }
    })
}

/// Wait for a termination signal, then close the server.
async fn wait_and_close(handle: ServerHandle) -> Result<()> {
    pavise::wait_for_shutdown().await?;
    info!("termination signal received, shutting down");
    handle.close();
    Ok(())
}
