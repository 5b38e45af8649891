use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rand::Rng;
use tokio::sync::{watch, RwLock};

use crate::common::{ActivationDecision, CameraId};
use crate::config::ScheduleConfig;
use crate::discovery::Discovery;
use crate::error::{AllocateError, CycleError};
use crate::network_manager::NetworkManager;
use crate::portal::PortalApi;



#[derive(Clone)]
#[derive(Copy)]
#[derive(Debug)]
#[derive(PartialEq, Eq)]
#[derive(Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrchestratorState {
	Idle,
	Discovering,
	Registering,
	Polling { cycle: u64 },
	Stopped,
}

/// What happened to one activation decision.
#[derive(Clone)]
#[derive(Debug)]
#[derive(PartialEq)]
#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProvisionOutcome {
	AlreadyProvisioned { virtual_address: Ipv4Addr },
	Provisioned { virtual_address: Ipv4Addr, redirect_complete: bool },
	Failed { reason: String },
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Default)]
#[derive(PartialEq)]
#[derive(Serialize)]
pub struct CycleReport {
	pub activated: usize,
	pub provisioned: Vec<(CameraId, Ipv4Addr)>,
	pub skipped: usize,
	pub failed: usize,
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Serialize)]
pub struct OrchestratorStatus {
	pub state: OrchestratorState,
	pub discovered: usize,
	/// `None` until a registration has been attempted.
	pub registered: Option<bool>,
	/// Includes cycles whose fetch failed.
	pub cycles_attempted: u64,
	pub cycles_completed: u64,
	pub last_cycle: Option<CycleReport>,
	pub last_cycle_at: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
}

impl Default for OrchestratorStatus {
	fn default() -> Self {
		Self {
			state: OrchestratorState::Idle,
			discovered: 0,
			registered: None,
			cycles_attempted: 0,
			cycles_completed: 0,
			last_cycle: None,
			last_cycle_at: None,
			last_error: None,
		}
	}
}

/// Discovers and registers cameras once, then keeps local virtual addresses in
/// step with the portal's activations.
pub struct Orchestrator {
	discovery: Discovery,
	portal: Arc<dyn PortalApi>,
	network: Arc<NetworkManager>,
	interface: String,
	redirect_port: u16,
	schedule: ScheduleConfig,
	status: RwLock<OrchestratorStatus>,
}

impl Orchestrator {
	pub fn new(
		discovery: Discovery,
		portal: Arc<dyn PortalApi>,
		network: Arc<NetworkManager>,
		interface: impl Into<String>,
		redirect_port: u16,
		schedule: ScheduleConfig,
	) -> Self {
		Self {
			discovery,
			portal,
			network,
			interface: interface.into(),
			redirect_port,
			schedule,
			status: RwLock::new(OrchestratorStatus::default()),
		}
	}

	pub async fn status(&self) -> OrchestratorStatus {
		self.status.read().await.clone()
	}

	async fn set_state(&self, state: OrchestratorState) {
		self.status.write().await.state = state;
	}

	/// One discovery pass, and a registration if it found anything.
	///
	/// A failed registration is recorded but does not stop polling from starting.
	pub async fn startup(&self) {
		info!("Starting camera manager on {}", self.interface);

		self.set_state(OrchestratorState::Discovering).await;
		let cameras = self.discovery.scan(&self.interface).await;
		self.status.write().await.discovered = cameras.len();

		if cameras.is_empty() {
			info!("No cameras discovered; skipping registration");
			return;
		}

		self.set_state(OrchestratorState::Registering).await;
		let registered = self.portal.register(&cameras).await;
		let mut status = self.status.write().await;
		status.registered = Some(registered.is_ok());
		if let Err(err) = registered {
			status.last_error = Some(err.to_string());
		}
	}

	/// Fetches activations and provisions every camera that has no assignment yet.
	///
	/// Existing assignments are never re-checked or removed here.
	pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
		{
			let mut status = self.status.write().await;
			status.cycles_attempted += 1;
			let cycle = status.cycles_attempted;
			status.state = OrchestratorState::Polling { cycle };
		}

		let decisions = match self.portal.fetch_activated().await {
			Ok(decisions) => decisions,
			Err(err) => {
				self.status.write().await.last_error = Some(err.to_string());
				return Err(err.into());
			},
		};

		let mut report = CycleReport {
			activated: decisions.len(),
			..CycleReport::default()
		};
		for decision in &decisions {
			match self.provision(decision).await {
				ProvisionOutcome::AlreadyProvisioned { .. } => report.skipped += 1,
				ProvisionOutcome::Provisioned { virtual_address, .. } => {
					report.provisioned.push((decision.camera_id.clone(), virtual_address));
				},
				ProvisionOutcome::Failed { .. } => report.failed += 1,
			}
		}

		let mut status = self.status.write().await;
		status.cycles_completed += 1;
		status.last_cycle = Some(report.clone());
		status.last_cycle_at = Some(Utc::now());
		if report.failed == 0 {
			status.last_error = None;
		}
		Ok(report)
	}

	/// Gives one activated camera a virtual address forwarding to its real one.
	pub async fn provision(&self, decision: &ActivationDecision) -> ProvisionOutcome {
		if let Some(existing) = self.network.get(&decision.camera_id).await {
			return ProvisionOutcome::AlreadyProvisioned { virtual_address: existing.virtual_address };
		}

		let virtual_address = match self.network.allocate(&decision.camera_id).await {
			Ok(address) => address,
			// another caller got there between the check and the allocation
			Err(AllocateError::AlreadyAssigned { address, .. }) => {
				return ProvisionOutcome::AlreadyProvisioned { virtual_address: address };
			},
			Err(err) => {
				error!("Could not allocate a virtual IP for camera {}: {}", decision.camera_id, err);
				return ProvisionOutcome::Failed { reason: err.to_string() };
			},
		};

		let port = decision.port.unwrap_or(self.redirect_port);
		let redirect = self.network.install_redirect(virtual_address, decision.original_address, port).await;
		if redirect.all_installed() {
			info!("Camera {} activated and ready at {}", decision.camera_id, virtual_address);
		} else {
			warn!(
				"Camera {} is at {} but {} of its forwarding rules did not install",
				decision.camera_id, virtual_address, redirect.failed_count()
			);
		}

		ProvisionOutcome::Provisioned {
			virtual_address,
			redirect_complete: redirect.all_installed(),
		}
	}

	/// Runs startup, then cycles until `stop` turns true or its sender goes away.
	///
	/// The stop signal is only looked at between cycles; a running cycle finishes.
	pub async fn run(&self, mut stop: watch::Receiver<bool>) {
		self.startup().await;

		loop {
			let stopped = *stop.borrow();
			if stopped {
				break;
			}

			let wait = match self.run_cycle().await {
				Ok(report) => {
					if !report.provisioned.is_empty() || report.failed > 0 {
						info!(
							"Cycle done: {} activated, {} provisioned, {} already provisioned, {} failed",
							report.activated, report.provisioned.len(), report.skipped, report.failed
						);
					}
					self.schedule.poll_interval()
				},
				Err(err) => {
					let backoff = self.backoff();
					error!("Error in monitor loop: {}; retrying in {:?}", err, backoff);
					backoff
				},
			};

			tokio::select! {
				_ = tokio::time::sleep(wait) => {},
				changed = stop.changed() => {
					if changed.is_err() {
						break;
					}
				},
			}
		}

		self.set_state(OrchestratorState::Stopped).await;
		info!("Stopping camera manager");
	}

	fn backoff(&self) -> Duration {
		let base = self.schedule.error_backoff();
		if self.schedule.backoff_jitter <= 0.0 {
			return base;
		}
		let jitter = rand::thread_rng().gen_range(0.0..self.schedule.backoff_jitter);
		base + base.mul_f64(jitter)
	}
}
