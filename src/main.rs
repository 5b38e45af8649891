#[macro_use] extern crate rocket;
#[macro_use] extern crate serde_derive;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use log::{error, info, warn};
use tokio::sync::watch;

use crate::config::{Config, ConfigSource};
use crate::discovery::{Discovery, HttpProbe};
use crate::network_manager::NetworkManager;
use crate::network_tool::{NetworkTool, SystemNetworkTool};
use crate::orchestrator::Orchestrator;
use crate::portal::{PortalApi, PortalClient};
use crate::store::AssignmentStore;

mod common;
mod config;
mod discovery;
mod error;
mod network_manager;
mod network_tool;
mod orchestrator;
mod portal;
mod rest_api;
mod store;
#[cfg(test)]
mod testing;



const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";
const SERVICE_PATH: &str = "/etc/systemd/system/camera-portal.service";


#[rocket::main]
async fn main() -> anyhow::Result<()> {
	let matches = Command::new("camera-portal-mgr")
		.version("0.1.0")
		.about("Discovers local IP cameras and provisions virtual addresses for the ones a portal activates.")
		.arg(
			Arg::new("config")
				.short('c')
				.long("config")
				.help("TOML file with manager config")
		)
		.arg(
			Arg::new("install")
				.long("install")
				.action(ArgAction::SetTrue)
				.help("Install and enable the systemd service, then exit")
		)
		.get_matches();

	if matches.get_flag("install") {
		return install_service();
	}

	// SAFETY: geteuid has no preconditions and cannot fail.
	if unsafe { libc::geteuid() } != 0 {
		bail!("camera-portal-mgr must be run as root");
	}

	let (config, config_source) = Config::load(matches.get_one::<String>("config").map(Path::new))?;

	let tool: Arc<dyn NetworkTool> = Arc::new(SystemNetworkTool::new(&config.tool));
	let probe = HttpProbe::new(Duration::from_secs(config.discovery.probe_timeout_secs))
		.context("failed to build HTTP probe client")?;
	let portal: Arc<dyn PortalApi> = Arc::new(PortalClient::new(&config.portal).context("failed to build portal client")?);
	let network = Arc::new(NetworkManager::new(
		tool.clone(),
		AssignmentStore::new(config.store.path.clone()),
		config.pool.clone(),
		config.interface.clone(),
	));
	let orchestrator = Arc::new(Orchestrator::new(
		Discovery::new(tool, Arc::new(probe), config.discovery.clone()),
		portal,
		network.clone(),
		config.interface.clone(),
		config.redirect.port,
		config.schedule.clone(),
	));

	let rocket_config = rocket::Config {
		address: config.control.address,
		port: config.control.port,
		log_level: config.log_level,
		..rocket::Config::default()
	};
	// Igniting sets up the logger, so do it before anything worth logging happens.
	let rocket = rocket::custom(rocket_config)
		.attach(rest_api::stage(network.clone(), orchestrator.clone()))
		.ignite()
		.await?;

	match &config_source {
		ConfigSource::File(path) => info!("Loaded config from {}", path.display()),
		ConfigSource::Defaults { missing } => warn!("No config file at {}; using built-in defaults", missing.display()),
	}

	tokio::fs::write(IP_FORWARD_PATH, "1").await
		.with_context(|| format!("failed to enable IP forwarding via {}", IP_FORWARD_PATH))?;

	if let Err(err) = network.load().await {
		error!("Error loading assignments; starting empty: {}", err);
	}

	let (stop_tx, stop_rx) = watch::channel(false);
	let polling = tokio::spawn({
		let orchestrator = orchestrator.clone();
		async move { orchestrator.run(stop_rx).await }
	});

	// Serves the control API until Ctrl-C.
	rocket.launch().await?;

	info!("Shutting down; waiting for the current cycle to finish");
	let _ = stop_tx.send(true);
	polling.await.context("polling task panicked")?;
	if let Err(err) = network.save().await {
		error!("Error saving assignments on shutdown: {}", err);
	}

	anyhow::Ok(())
}

fn install_service() -> anyhow::Result<()> {
	let executable = std::env::current_exe().context("failed to locate own executable")?;
	let unit = format!(
		"[Unit]\n\
		Description=IP Camera Portal Manager\n\
		After=network.target\n\
		Wants=network.target\n\
		\n\
		[Service]\n\
		Type=simple\n\
		User=root\n\
		ExecStart={}\n\
		Restart=on-failure\n\
		RestartSec=5s\n\
		\n\
		[Install]\n\
		WantedBy=multi-user.target\n",
		executable.display()
	);

	std::fs::write(SERVICE_PATH, unit).with_context(|| format!("failed to write {}", SERVICE_PATH))?;
	for args in [&["daemon-reload"][..], &["enable", "camera-portal.service"][..]] {
		let status = std::process::Command::new("systemctl").args(args).status()
			.with_context(|| format!("failed to run systemctl {}", args.join(" ")))?;
		if !status.success() {
			bail!("systemctl {} exited with {}", args.join(" "), status);
		}
	}

	println!("Service installed. Start with: sudo systemctl start camera-portal");
	println!("View logs with: sudo journalctl -u camera-portal -f");
	Ok(())
}
