use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info};

use crate::common::{CameraList, CameraRecord, UNKNOWN_HINT};
use crate::config::DiscoveryConfig;
use crate::network_tool::NetworkTool;



pub const GENERIC_MODEL: &str = "Generic IP Camera";

/// Fetches a device's web landing page.
#[async_trait::async_trait]
pub trait WebProbe: Send + Sync {
	/// Body of a 200 answer to `GET http://<address>:<port>/`, `None` on any failure.
	async fn fetch_page(&self, address: Ipv4Addr, port: u16) -> Option<String>;
}

pub struct HttpProbe {
	client: reqwest::Client,
}

impl HttpProbe {
	pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.connect_timeout(timeout)
			.build()?;
		Ok(Self { client })
	}
}

#[async_trait::async_trait]
impl WebProbe for HttpProbe {
	async fn fetch_page(&self, address: Ipv4Addr, port: u16) -> Option<String> {
		let url = format!("http://{}:{}", address, port);
		let response = match self.client.get(&url).send().await {
			Ok(response) => response,
			Err(err) => {
				debug!("HTTP probe of {} failed: {}", url, err);
				return None;
			},
		};
		if response.status() != reqwest::StatusCode::OK {
			debug!("HTTP probe of {} answered {}", url, response.status());
			return None;
		}
		response.text().await.ok()
	}
}

/// A line of scan output, before classification.
#[derive(Clone)]
#[derive(Debug)]
#[derive(PartialEq)]
struct ScannedDevice {
	address: Ipv4Addr,
	hardware_address: String,
	vendor: String,
}

/// Finds camera candidates on a local segment.
pub struct Discovery {
	tool: Arc<dyn NetworkTool>,
	probe: Arc<dyn WebProbe>,
	config: DiscoveryConfig,
}

impl Discovery {
	pub fn new(tool: Arc<dyn NetworkTool>, probe: Arc<dyn WebProbe>, config: DiscoveryConfig) -> Self {
		Self { tool, probe, config }
	}

	/// Scans `interface` and returns the devices whose vendor is a known camera maker.
	///
	/// A failed scan is logged and gives an empty list.
	pub async fn scan(&self, interface: &str) -> CameraList {
		let output = match self.tool.scan(interface).await {
			Ok(output) if output.success => output.output,
			Ok(output) => {
				error!("Error scanning network on {}: {}", interface, output.output);
				return CameraList::new();
			},
			Err(err) => {
				error!("Error scanning network on {}: {}", interface, err);
				return CameraList::new();
			},
		};

		let mut cameras = CameraList::new();
		for device in parse_scan_output(&output) {
			if !self.is_camera_vendor(&device.vendor) {
				debug!("Skipping {} ({}): not a known camera vendor", device.address, device.vendor);
				continue;
			}
			cameras.push(self.probe_device(device).await);
		}

		info!("Discovered {} potential cameras", cameras.len());
		cameras
	}

	fn is_camera_vendor(&self, vendor: &str) -> bool {
		let vendor = vendor.to_lowercase();
		self.config.vendors.iter().any(|known| vendor.contains(&known.to_lowercase()))
	}

	async fn probe_device(&self, device: ScannedDevice) -> CameraRecord {
		let mut model_hint = UNKNOWN_HINT.to_string();
		for port in &self.config.web_ports {
			if let Some(page) = self.probe.fetch_page(device.address, *port).await {
				if looks_like_camera_page(&page) {
					model_hint = GENERIC_MODEL.to_string();
					break;
				}
			}
		}

		// Not verified against the device; a wrong path shows up later as a failed stream connect.
		let stream_endpoint = self.config.stream_paths.first().map(|path| {
			format!("rtsp://{}:{}{}", device.address, self.config.stream_port, path)
		});

		CameraRecord {
			physical_address: device.address,
			hardware_address: device.hardware_address,
			vendor_hint: device.vendor,
			model_hint,
			stream_endpoint,
			discovered_at: Utc::now(),
		}
	}
}

fn looks_like_camera_page(page: &str) -> bool {
	let page = page.to_lowercase();
	page.contains("camera") || page.contains("ip")
}

/// Parses arp-scan's `address<TAB>hardware<TAB>vendor` lines.
///
/// Lines not starting with an IPv4 address are skipped, and a repeated address
/// keeps its first entry.
fn parse_scan_output(output: &str) -> Vec<ScannedDevice> {
	let mut seen = HashSet::new();
	let mut devices = Vec::new();

	for line in output.lines() {
		let mut fields = line.split('\t').map(str::trim);
		let address = match fields.next().and_then(|f| f.parse::<Ipv4Addr>().ok()) {
			Some(address) => address,
			None => continue,
		};
		let hardware_address = match fields.next() {
			Some(hw) if !hw.is_empty() => hw.to_string(),
			_ => continue,
		};
		let vendor = match fields.next() {
			Some(vendor) if !vendor.is_empty() => vendor.to_string(),
			_ => UNKNOWN_HINT.to_string(),
		};

		if seen.insert(address) {
			devices.push(ScannedDevice { address, hardware_address, vendor });
		}
	}

	devices
}
