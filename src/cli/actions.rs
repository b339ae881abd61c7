use anyhow::{anyhow, Result};
use clap::ArgMatches;
use std::sync::Arc;

use crate::{
    api::sink::{ChannelSink, JsonLinesSink, LoggingSink},
    cli::config::EngineConfig,
    core::runtime::Engine,
    utils::enumerate_ports,
};

/// Handle one-shot flags. Returns `Ok(true)` when the process should exit.
pub fn run_one_shot_actions(matches: &ArgMatches) -> Result<bool> {
    if matches.get_flag("list-ports") {
        let ports = enumerate_ports()?;
        if matches.get_flag("json") {
            let entries: Vec<serde_json::Value> = ports
                .iter()
                .map(|(name, kind)| serde_json::json!({ "port_name": name, "port_type": kind }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        } else if ports.is_empty() {
            println!("No serial ports found");
        } else {
            for (name, kind) in ports {
                println!("{name}\t{kind}");
            }
        }
        return Ok(true);
    }

    if matches.get_flag("check") {
        let config = load_config(matches)?;
        println!("{}", config.to_json()?);
        log::info!(
            "Configuration OK: {} transport(s), {} link(s)",
            config.transports.len(),
            config.links.len()
        );
        return Ok(true);
    }

    Ok(false)
}

fn load_config(matches: &ArgMatches) -> Result<EngineConfig> {
    let path = matches
        .get_one::<String>("config")
        .ok_or_else(|| anyhow!("--config is required"))?;
    let config = EngineConfig::from_file(path)?;
    config.validate()?;
    Ok(config)
}

/// Run the engine until Ctrl-C.
pub async fn run_engine(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let sink: Arc<dyn ChannelSink> = if matches.get_flag("json") {
        Arc::new(JsonLinesSink::new(std::io::stdout()))
    } else {
        Arc::new(LoggingSink)
    };

    let (stop_tx, stop_rx) = flume::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })?;

    let engine = Engine::start(config, sink).await?;
    let _ = stop_rx.recv_async().await;
    log::info!("Interrupted, shutting down");
    engine.shutdown().await;
    Ok(())
}
