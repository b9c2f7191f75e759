use std::process::ExitCode;

use obsnet::daemon::{DaemonCore, Device, DeviceContext};
use obsnet::util::{init_logging, unix_now};
use obsnet::value::{Value, ValueData};
use obsnet::{Block, Config, Daemon, DeviceType, Result};

/// Device without hardware, reporting when it was last queried
struct GenericDevice {
    device_type: DeviceType,
}

impl Device for GenericDevice {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn init_values(&mut self, core: &mut DaemonCore) -> Result<()> {
        core.add_value(Value::new(
            "infotime",
            "time of the last info call",
            ValueData::Time(unix_now()),
        ))
    }

    fn info(&mut self, ctx: &mut DeviceContext<'_>) -> Result<()> {
        ctx.set_value("infotime", ValueData::Time(unix_now()))?;
        Ok(())
    }
}

async fn run(path: &str) -> Result<()> {
    let config = Config::load(path)?;
    tracing::info!(name = %config.name, device_type = %config.device_type, "starting");

    let mut daemon = Daemon::new(GenericDevice {
        device_type: config.device_type,
    })?;
    let mut block = Block::bind(config).await?;
    if let Some(addr) = block.local_addr() {
        tracing::info!(%addr, "listening");
    }

    tokio::select! {
        result = block.run(&mut daemon) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: obsnetd <config.toml> [log-level]");
        return ExitCode::FAILURE;
    };
    let level = args.next().unwrap_or_else(|| "info".to_string());
    if let Err(e) = init_logging(&level) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(&path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "obsnetd failed");
            ExitCode::FAILURE
        }
    }
}
