use anyhow::{Context, Error};
use cameractl::{
    config::Config,
    controller::{Controller, ControllerOptions},
    monitor::PollingMonitor,
    snapshots::capture::FfmpegCapturer,
    util::logging,
};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tokio::signal::ctrl_c;

#[derive(Debug, Parser)]
#[clap(name = "cameractl")]
struct Arguments {
    /// JSON configuration file; defaults are used when absent
    #[clap(long)]
    config: Option<PathBuf>,

    #[clap(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let arguments = Arguments::parse();

    logging::configure(module_path!(), arguments.verbose);

    let config = match arguments.config.as_ref() {
        Some(path) => {
            let content = std::fs::read_to_string(path).context("config read")?;
            serde_json::from_str::<Config>(&content).context("config parse")?
        }
        None => Config::default(),
    };

    let monitor = Arc::new(PollingMonitor::new(&config.monitor));
    let capturer = Arc::new(FfmpegCapturer::new());

    let controller = Controller::new(
        config,
        monitor,
        capturer,
        ControllerOptions::default(),
    )
    .context("controller")?;

    controller.start().await.map_err(Error::new).context("start")?;

    log::info!("cameractl started, awaiting exit signal");
    ctrl_c().await.context("ctrl_c")?;
    log::info!("received exit signal, closing");

    controller.stop().await.map_err(Error::new).context("stop")?;

    Ok(())
}
