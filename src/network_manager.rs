use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::RwLock;

use crate::common::{AssignmentMap, VirtualAssignment};
use crate::config::PoolConfig;
use crate::error::{AllocateError, StoreError, ToolError};
use crate::network_tool::{NetworkTool, RedirectRule, ToolOutput};
use crate::store::AssignmentStore;



/// Result of `release`.
#[derive(Clone)]
#[derive(Debug)]
#[derive(PartialEq)]
pub enum ReleaseOutcome {
	NotAssigned,
	Released(VirtualAssignment),
	/// Removing the address failed; the assignment is still recorded.
	Kept { reason: String },
}

/// Which redirect rules went in.
#[derive(Clone)]
#[derive(Debug)]
#[derive(PartialEq)]
pub struct RedirectOutcome {
	pub rules: Vec<(RedirectRule, bool)>,
}

impl RedirectOutcome {
	pub fn all_installed(&self) -> bool {
		self.rules.iter().all(|(_, installed)| *installed)
	}

	pub fn failed_count(&self) -> usize {
		self.rules.iter().filter(|(_, installed)| !installed).count()
	}
}

/// Owns the camera → virtual address mapping and the system state behind it.
pub struct NetworkManager {
	tool: Arc<dyn NetworkTool>,
	store: AssignmentStore,
	pool: PoolConfig,
	base_interface: String,
	// Writers hold the lock across the external commands and the save, so each
	// mutation (including its persistence) is one critical section.
	assignments: RwLock<AssignmentMap>,
}

impl NetworkManager {
	pub fn new(tool: Arc<dyn NetworkTool>, store: AssignmentStore, pool: PoolConfig, base_interface: impl Into<String>) -> Self {
		Self {
			tool,
			store,
			pool,
			base_interface: base_interface.into(),
			assignments: RwLock::new(AssignmentMap::new()),
		}
	}

	/// Replaces the in-memory mapping with the stored one.
	///
	/// On error the in-memory mapping is left as it was.
	pub async fn load(&self) -> Result<usize, StoreError> {
		let mut assignments = self.assignments.write().await;
		let file = self.store.load().await?;
		*assignments = file.virtual_ips;
		info!("Loaded {} virtual address assignments from {}", assignments.len(), self.store.path().display());
		Ok(assignments.len())
	}

	pub async fn save(&self) -> Result<(), StoreError> {
		let assignments = self.assignments.read().await;
		self.store.save(&assignments).await
	}

	pub async fn assignments(&self) -> Vec<VirtualAssignment> {
		self.assignments.read().await.values().cloned().collect()
	}

	pub async fn get(&self, camera_id: &str) -> Option<VirtualAssignment> {
		self.assignments.read().await.get(camera_id).cloned()
	}

	pub async fn contains(&self, camera_id: &str) -> bool {
		self.assignments.read().await.contains_key(camera_id)
	}

	/// Binds the next pool address to the base interface under a new label and brings it up.
	///
	/// Nothing is recorded unless both steps succeed. If bringing the label up
	/// fails, the address added in the first step is removed again.
	pub async fn allocate(&self, camera_id: &str) -> Result<Ipv4Addr, AllocateError> {
		let mut assignments = self.assignments.write().await;

		if let Some(existing) = assignments.get(camera_id) {
			return Err(AllocateError::AlreadyAssigned {
				camera_id: camera_id.to_string(),
				address: existing.virtual_address,
			});
		}

		let position = next_position(&assignments, &self.pool)?;
		let address = pool_address(&self.pool, position);
		let label = format!("{}:{}{}", self.base_interface, self.pool.label_prefix, position);

		let added = self.tool.add_address(address, self.pool.prefix_len, &self.base_interface, &label).await?;
		if !added.success {
			error!("Failed to add {} to {} as {}: {}", address, self.base_interface, label, added.output);
			return Err(AllocateError::StepFailed {
				step: format!("add {}/{} to {}", address, self.pool.prefix_len, self.base_interface),
				output: added.output,
			});
		}

		let raised = self.tool.link_up(&label).await;
		let failure = match raised {
			Ok(ToolOutput { success: true, .. }) => None,
			Ok(output) => Some(AllocateError::StepFailed {
				step: format!("bring up {}", label),
				output: output.output,
			}),
			Err(err) => Some(AllocateError::Tool(err)),
		};
		if let Some(failure) = failure {
			error!("Failed to bring up {}: {}", label, failure);
			self.roll_back_address(address, &label).await;
			return Err(failure);
		}

		assignments.insert(camera_id.to_string(), VirtualAssignment {
			camera_id: camera_id.to_string(),
			virtual_address: address,
			local_interface_label: label,
			base_interface: self.base_interface.clone(),
			created_at: Utc::now(),
		});
		self.persist(&assignments).await;
		info!("Created virtual IP {} for camera {}", address, camera_id);

		Ok(address)
	}

	/// Removes the camera's address; the record is dropped only if that worked.
	pub async fn release(&self, camera_id: &str) -> ReleaseOutcome {
		let mut assignments = self.assignments.write().await;

		let assignment = match assignments.get(camera_id) {
			Some(assignment) => assignment.clone(),
			None => return ReleaseOutcome::NotAssigned,
		};

		let removed = self.tool.remove_address(
			assignment.virtual_address,
			self.pool.prefix_len,
			&assignment.base_interface,
			&assignment.local_interface_label,
		).await;

		let reason = match removed {
			Ok(output) if output.success => None,
			Ok(output) => Some(output.output),
			Err(err) => Some(err.to_string()),
		};
		if let Some(reason) = reason {
			error!("Failed to remove virtual IP {} for camera {}: {}", assignment.virtual_address, camera_id, reason);
			return ReleaseOutcome::Kept { reason };
		}

		assignments.remove(camera_id);
		self.persist(&assignments).await;
		info!("Removed virtual IP {} for camera {}", assignment.virtual_address, camera_id);

		ReleaseOutcome::Released(assignment)
	}

	/// Installs the four forwarding rules from `virtual_address` to `target`.
	///
	/// Every rule is attempted; a failed rule is logged and the rest still run.
	/// Rules already present from a previous run may be added a second time.
	pub async fn install_redirect(&self, virtual_address: Ipv4Addr, target: Ipv4Addr, target_port: u16) -> RedirectOutcome {
		let mut rules = Vec::with_capacity(4);
		for rule in RedirectRule::for_redirect(virtual_address, target, target_port) {
			let installed = match self.tool.install_rule(&rule).await {
				Ok(output) if output.success => true,
				Ok(output) => {
					warn!("Rule may already exist or failed ({}): {}", rule, output.output);
					false
				},
				Err(err) => {
					warn!("Could not run {}: {}", rule, err);
					false
				},
			};
			rules.push((rule, installed));
		}

		info!("Set up port forwarding: {}:{} -> {}:{}", virtual_address, target_port, target, target_port);
		RedirectOutcome { rules }
	}

	async fn roll_back_address(&self, address: Ipv4Addr, label: &str) {
		let result: Result<ToolOutput, ToolError> = self.tool
			.remove_address(address, self.pool.prefix_len, &self.base_interface, label)
			.await;
		match result {
			Ok(output) if output.success => info!("Rolled back {} on {}", address, label),
			Ok(output) => error!("Rollback of {} on {} failed; address left configured: {}", address, label, output.output),
			Err(err) => error!("Rollback of {} on {} failed; address left configured: {}", address, label, err),
		}
	}

	async fn persist(&self, assignments: &AssignmentMap) {
		if let Err(err) = self.store.save(assignments).await {
			error!("Failed to save assignments; continuing with in-memory state: {}", err);
		}
	}
}

fn pool_address(pool: &PoolConfig, position: u32) -> Ipv4Addr {
	Ipv4Addr::from(u32::from(pool.base_address) + position)
}

/// Position N = number of current assignments, moved forward past positions
/// still held so addresses stay distinct after a release. Positions below N are
/// never reused; a full top of the pool is exhaustion.
fn next_position(assignments: &AssignmentMap, pool: &PoolConfig) -> Result<u32, AllocateError> {
	let taken = |position: u32| {
		let address = pool_address(pool, position);
		assignments.values().any(|a| a.virtual_address == address)
	};

	let start = u32::try_from(assignments.len()).unwrap_or(u32::MAX);
	(start..pool.size)
		.find(|position| !taken(*position))
		.ok_or(AllocateError::PoolExhausted { size: pool.size })
}
