use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rocket::config::LogLevel;

use crate::error::ConfigError;



pub const DEFAULT_CONFIG_PATH: &str = "/etc/camera_portal/manager.toml";

/// Everything the manager needs, handed to each component when it is built.
#[derive(Clone)]
#[derive(Debug)]
#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
	/// Interface scanned for cameras and carrying the virtual addresses.
	pub interface: String,
	pub log_level: LogLevel,
	pub portal: PortalConfig,
	pub pool: PoolConfig,
	pub discovery: DiscoveryConfig,
	pub redirect: RedirectConfig,
	pub schedule: ScheduleConfig,
	pub store: StoreConfig,
	pub tool: ToolConfig,
	pub control: ControlConfig,
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Deserialize)]
#[serde(default)]
pub struct PortalConfig {
	pub url: String,
	pub api_key: String,
	pub request_timeout_secs: u64,
	pub machine_id_path: PathBuf,
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Deserialize)]
#[serde(default)]
pub struct PoolConfig {
	pub base_address: Ipv4Addr,
	pub prefix_len: u8,
	pub size: u32,
	pub label_prefix: String,
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
	/// Vendor names, matched case-insensitively as substrings of the scan's vendor column.
	pub vendors: Vec<String>,
	pub web_ports: Vec<u16>,
	pub probe_timeout_secs: u64,
	pub stream_port: u16,
	/// Tried in order; only the first is used.
	pub stream_paths: Vec<String>,
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
	pub port: u16,
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
	pub poll_interval_secs: u64,
	pub error_backoff_secs: u64,
	/// Fraction of the backoff added at random, 0.0 to disable.
	pub backoff_jitter: f64,
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Deserialize)]
#[serde(default)]
pub struct StoreConfig {
	pub path: PathBuf,
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Deserialize)]
#[serde(default)]
pub struct ToolConfig {
	pub command_timeout_secs: u64,
	pub use_sudo: bool,
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Deserialize)]
#[serde(default)]
pub struct ControlConfig {
	pub address: IpAddr,
	pub port: u16,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			interface: "eth0".to_string(),
			log_level: LogLevel::Normal,
			portal: PortalConfig::default(),
			pool: PoolConfig::default(),
			discovery: DiscoveryConfig::default(),
			redirect: RedirectConfig::default(),
			schedule: ScheduleConfig::default(),
			store: StoreConfig::default(),
			tool: ToolConfig::default(),
			control: ControlConfig::default(),
		}
	}
}

impl Default for PortalConfig {
	fn default() -> Self {
		Self {
			url: "https://your-portal-api.example.com".to_string(),
			api_key: String::new(),
			request_timeout_secs: 10,
			machine_id_path: PathBuf::from("/etc/machine-id"),
		}
	}
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			base_address: Ipv4Addr::new(192, 168, 1, 200),
			prefix_len: 24,
			size: 50,
			label_prefix: "cam".to_string(),
		}
	}
}

impl Default for DiscoveryConfig {
	fn default() -> Self {
		let vendors = [
			"hikvision", "dahua", "axis", "bosch", "sony",
			"panasonic", "samsung", "vivotek", "arecont",
		];
		let stream_paths = [
			"/live/main", "/live", "/stream", "/video", "/h264",
			"/cam/realmonitor", "/MediaInput/h264",
		];
		Self {
			vendors: vendors.iter().map(|v| v.to_string()).collect(),
			web_ports: vec![80, 8080, 8000],
			probe_timeout_secs: 2,
			stream_port: 554,
			stream_paths: stream_paths.iter().map(|p| p.to_string()).collect(),
		}
	}
}

impl Default for RedirectConfig {
	fn default() -> Self {
		Self { port: 554 }
	}
}

impl Default for ScheduleConfig {
	fn default() -> Self {
		Self {
			poll_interval_secs: 30,
			error_backoff_secs: 60,
			backoff_jitter: 0.1,
		}
	}
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self { path: PathBuf::from("/etc/camera_portal/config.json") }
	}
}

impl Default for ToolConfig {
	fn default() -> Self {
		Self {
			command_timeout_secs: 15,
			use_sudo: false,
		}
	}
}

impl Default for ControlConfig {
	fn default() -> Self {
		Self {
			address: IpAddr::V4(Ipv4Addr::LOCALHOST),
			port: 8420,
		}
	}
}

impl ScheduleConfig {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_secs(self.poll_interval_secs)
	}

	pub fn error_backoff(&self) -> Duration {
		Duration::from_secs(self.error_backoff_secs)
	}
}

/// Where the loaded config came from, so it can be reported once logging is up.
#[derive(Clone)]
#[derive(Debug)]
#[derive(PartialEq)]
pub enum ConfigSource {
	File(PathBuf),
	/// The default path did not exist.
	Defaults { missing: PathBuf },
}

impl Config {
	/// Reads the given file, or the default path when none is given.
	///
	/// Only the default path may be missing; an explicitly named file must exist.
	pub fn load(path: Option<&Path>) -> Result<(Config, ConfigSource), ConfigError> {
		match path {
			Some(path) => Config::load_from(path, true),
			None => Config::load_from(Path::new(DEFAULT_CONFIG_PATH), false),
		}
	}

	fn load_from(path: &Path, explicit: bool) -> Result<(Config, ConfigSource), ConfigError> {
		let path = path.to_path_buf();
		let text = match std::fs::read_to_string(&path) {
			Ok(text) => text,
			Err(err) if !explicit && err.kind() == std::io::ErrorKind::NotFound => {
				return Ok((Config::default(), ConfigSource::Defaults { missing: path }));
			},
			Err(source) => return Err(ConfigError::Read { path, source }),
		};

		match Config::parse(&text) {
			Ok(config) => Ok((config, ConfigSource::File(path))),
			Err(ParseFailure::Toml(source)) => Err(ConfigError::Parse { path, source }),
			Err(ParseFailure::Invalid(reason)) => Err(ConfigError::Invalid(reason)),
		}
	}

	fn parse(text: &str) -> Result<Config, ParseFailure> {
		let config: Config = toml::from_str(text).map_err(ParseFailure::Toml)?;
		config.validate().map_err(ParseFailure::Invalid)?;
		Ok(config)
	}

	fn validate(&self) -> Result<(), String> {
		if self.interface.is_empty() {
			return Err("interface must not be empty".to_string());
		}
		if self.pool.size == 0 {
			return Err("pool.size must be at least 1".to_string());
		}
		if self.pool.prefix_len > 32 {
			return Err(format!("pool.prefix_len {} is larger than 32", self.pool.prefix_len));
		}
		let base = u32::from(self.pool.base_address);
		if base.checked_add(self.pool.size - 1).is_none() {
			return Err(format!(
				"pool of {} addresses starting at {} runs past 255.255.255.255",
				self.pool.size, self.pool.base_address
			));
		}
		if self.schedule.poll_interval_secs == 0 || self.schedule.error_backoff_secs == 0 {
			return Err("schedule intervals must be greater than zero".to_string());
		}
		if !(0.0..=1.0).contains(&self.schedule.backoff_jitter) {
			return Err("schedule.backoff_jitter must be between 0.0 and 1.0".to_string());
		}
		if self.tool.command_timeout_secs == 0 {
			return Err("tool.command_timeout_secs must be greater than zero".to_string());
		}
		Ok(())
	}
}

#[derive(Debug)]
enum ParseFailure {
	Toml(toml::de::Error),
	Invalid(String),
}
