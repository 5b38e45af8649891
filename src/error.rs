use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;



/// Failure to run an external network command at all.
///
/// A command that runs and exits non-zero is not a `ToolError`; it comes back
/// as a `ToolOutput` with `success == false`.
#[derive(Debug, Error)]
pub enum ToolError {
	#[error("failed to spawn `{command}`: {source}")]
	Spawn {
		command: String,
		#[source]
		source: std::io::Error,
	},

	#[error("`{command}` did not finish within {timeout:?}")]
	Timeout {
		command: String,
		timeout: Duration,
	},
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("failed to access assignment store {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("assignment store {path} is malformed: {source}")]
	Malformed {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("failed to serialize assignments: {0}")]
	Serialize(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AllocateError {
	#[error("camera {camera_id} already has virtual address {address}")]
	AlreadyAssigned {
		camera_id: String,
		address: Ipv4Addr,
	},

	#[error("virtual address pool of {size} addresses is exhausted")]
	PoolExhausted {
		size: u32,
	},

	#[error("`{step}` failed: {output}")]
	StepFailed {
		step: String,
		output: String,
	},

	#[error(transparent)]
	Tool(#[from] ToolError),
}

#[derive(Debug, Error)]
pub enum PortalError {
	#[error("portal request failed: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("portal answered {status}: {body}")]
	Status {
		status: u16,
		body: String,
	},

	#[error("invalid portal url: {0}")]
	Url(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file {path}: {source}")]
	Parse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("invalid configuration: {0}")]
	Invalid(String),
}

/// Why a reconciliation cycle could not run.
#[derive(Debug, Error)]
pub enum CycleError {
	#[error("could not fetch activations: {0}")]
	Fetch(#[from] PortalError),
}
