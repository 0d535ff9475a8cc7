//! Serial Modem Host
//!
//! Runs the AT host on a serial port with the simulated modem answering commands.
//! The host switches the link to CMUX when the terminal sends `AT#XCMUX`.
//!
//! Usage: `sm-modem [settings.json]`. Without a configured port the available serial
//! ports are listed instead.

mod ports;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use sm_host::spawn_host_worker;
use sm_pipe::UartPipe;
use sm_sim::SimModem;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sm_host=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting serial modem host");

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let settings = Settings::load(path.as_deref());

    if settings.port.is_empty() {
        for entry in ports::list_ports()? {
            println!("{}", entry.label());
        }
        bail!("No serial port configured; set \"port\" in the settings file");
    }

    let pipe = UartPipe::open_serial(&settings.port, settings.baud_rate, settings.uart.clone())
        .with_context(|| format!("Failed to open {}", settings.port))?;
    let engine = SimModem::new(settings.modem.clone());
    let (handle, mut worker) =
        spawn_host_worker(settings.host_config(), Arc::new(pipe), Box::new(engine));

    tokio::select! {
        result = &mut worker => {
            let result = result.context("Host worker panicked")?;
            if let Err(e) = &result {
                error!("Host worker stopped: {}", e);
            }
            result.context("Host worker failed")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
            handle.shutdown().await.context("Host worker already stopped")?;
            worker
                .await
                .context("Host worker panicked")?
                .context("Host worker failed")?;
        }
    }

    Ok(())
}
