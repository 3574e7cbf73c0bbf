use crate::config::NodeConfig;
use crate::utils::status::RunState;
use anyhow::Context;
use log::{error, info, warn};
use std::{panic, process};

pub mod assets;
pub mod capture;
pub mod config;
pub mod control;
pub mod discovery;
pub mod encoder;
pub mod error;
pub mod node;
pub mod pipeline;
#[cfg(feature = "preview")]
pub mod preview;
pub mod transport;
pub mod utils;

fn main() {
    tracing_subscriber::fmt::init();

    let matches = NodeConfig::command().get_matches();
    let display_available = std::env::var_os("DISPLAY").is_some_and(|d| !d.is_empty());
    let config = match NodeConfig::from_matches(&matches, display_available) {
        Ok(config) => config,
        Err(e) => {
            let e = error::NodeError::from(e);
            error!("{}", e);
            process::exit(e.exit_code());
        }
    };

    info!(
        "{} v{}: camera '{}' ({}), device {}, broker {}, relay {}",
        config::app_name(),
        config::app_version(),
        config.camera_name,
        config.camera_id,
        config.device,
        config.broker,
        config.relay_url()
    );

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // invoke the default handler and exit the process
        orig_hook(panic_info);
        process::exit(105);
    }));

    let run_state = RunState::new(true);
    if let Err(e) = install_signal_handler(run_state.clone()) {
        warn!("Node: {:#}", e);
    }

    match node::run(config, run_state) {
        Ok(()) => info!("Node: clean exit"),
        Err(e) => {
            error!("{}", e);
            if let Some(hint) = e.guidance() {
                error!("{}", hint);
            }
            process::exit(e.exit_code());
        }
    }
}

/// First SIGINT, SIGTERM or SIGHUP stops the node cleanly, a second one exits.
fn install_signal_handler(run_state: RunState) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        if run_state.shutdown() {
            warn!("Node: signal received, shutting down");
        } else {
            process::exit(130);
        }
    })
    .context("could not install the signal handler")
}
