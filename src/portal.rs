use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use url::Url;

use crate::common::{ActivationDecision, CameraRecord};
use crate::config::PortalConfig;
use crate::error::PortalError;



/// The remote control plane that decides which cameras to provision.
#[async_trait::async_trait]
pub trait PortalApi: Send + Sync {
	/// Reports discovered cameras. An empty list is not sent.
	async fn register(&self, cameras: &[CameraRecord]) -> Result<(), PortalError>;

	/// Cameras the portal wants provisioned on this machine.
	///
	/// `Ok(vec![])` means the portal answered with none; a failed request is `Err`.
	async fn fetch_activated(&self) -> Result<Vec<ActivationDecision>, PortalError>;
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
	machine_id: &'a str,
	cameras: &'a [CameraRecord],
	timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ActivatedResponse {
	#[serde(default)]
	activated_cameras: Vec<RawDecision>,
}

// Entries are checked one by one so a single bad entry doesn't hide the rest.
#[derive(Deserialize)]
struct RawDecision {
	camera_id: Option<String>,
	original_ip: Option<String>,
	#[serde(default)]
	port: Option<u16>,
}

impl RawDecision {
	fn into_decision(self) -> Option<ActivationDecision> {
		let camera_id = self.camera_id.filter(|id| !id.is_empty());
		let address = self.original_ip.as_deref().and_then(|ip| ip.parse::<Ipv4Addr>().ok());
		match (camera_id, address) {
			(Some(camera_id), Some(original_address)) => Some(ActivationDecision {
				camera_id,
				original_address,
				port: self.port,
			}),
			(camera_id, _) => {
				warn!("Ignoring activation entry camera_id={:?} original_ip={:?}", camera_id, self.original_ip);
				None
			},
		}
	}
}

/// HTTP client for the portal, authenticated with a bearer key.
pub struct PortalClient {
	http: reqwest::Client,
	base_url: Url,
	api_key: String,
	machine_id: String,
}

impl PortalClient {
	pub fn new(config: &PortalConfig) -> Result<Self, PortalError> {
		let mut base_url = Url::parse(&config.url)?;
		// Url::join replaces the last segment unless the path ends in a slash.
		if !base_url.path().ends_with('/') {
			let path = format!("{}/", base_url.path());
			base_url.set_path(&path);
		}

		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(config.request_timeout_secs))
			.build()?;

		Ok(Self {
			http,
			base_url,
			api_key: config.api_key.clone(),
			machine_id: resolve_machine_id(&config.machine_id_path),
		})
	}

	async fn try_register(&self, cameras: &[CameraRecord]) -> Result<(), PortalError> {
		let endpoint = self.base_url.join("api/cameras/register")?;
		let request = RegisterRequest {
			machine_id: &self.machine_id,
			cameras,
			timestamp: Utc::now(),
		};

		let response = self.http.post(endpoint)
			.bearer_auth(&self.api_key)
			.json(&request)
			.send()
			.await?;
		check_status(response).await?;
		Ok(())
	}

	async fn try_fetch_activated(&self) -> Result<Vec<ActivationDecision>, PortalError> {
		let endpoint = self.base_url.join("api/cameras/activated")?;
		let response = self.http.get(endpoint)
			.bearer_auth(&self.api_key)
			.query(&[("machine_id", self.machine_id.as_str())])
			.send()
			.await?;
		let body: ActivatedResponse = check_status(response).await?.json().await?;
		Ok(body.activated_cameras.into_iter().filter_map(RawDecision::into_decision).collect())
	}
}

#[async_trait::async_trait]
impl PortalApi for PortalClient {
	async fn register(&self, cameras: &[CameraRecord]) -> Result<(), PortalError> {
		if cameras.is_empty() {
			info!("No cameras to register");
			return Ok(());
		}
		match self.try_register(cameras).await {
			Ok(()) => {
				info!("Registered {} cameras with portal", cameras.len());
				Ok(())
			},
			Err(err) => {
				error!("Failed to register cameras: {}", err);
				Err(err)
			},
		}
	}

	async fn fetch_activated(&self) -> Result<Vec<ActivationDecision>, PortalError> {
		self.try_fetch_activated().await.map_err(|err| {
			error!("Failed to get activated cameras: {}", err);
			err
		})
	}
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PortalError> {
	if response.status() == reqwest::StatusCode::OK {
		return Ok(response);
	}
	let status = response.status().as_u16();
	let body = response.text().await.unwrap_or_default();
	Err(PortalError::Status { status, body })
}

const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

/// The machine-id file's contents, or the hostname if that is missing or empty.
pub fn resolve_machine_id(path: &Path) -> String {
	read_trimmed(path)
		.or_else(|| read_trimmed(Path::new(HOSTNAME_PATH)))
		.unwrap_or_else(|| "unknown-host".to_string())
}

fn read_trimmed(path: &Path) -> Option<String> {
	let contents = std::fs::read_to_string(path).ok()?;
	let trimmed = contents.trim();
	if trimmed.is_empty() {
		None
	} else {
		Some(trimmed.to_string())
	}
}



#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::serve_once;

	fn client(url: &str, dir: &tempfile::TempDir) -> PortalClient {
		let machine_id_path = dir.path().join("machine-id");
		std::fs::write(&machine_id_path, "abc123\n").unwrap();
		PortalClient::new(&PortalConfig {
			url: url.to_string(),
			api_key: "key-1".to_string(),
			request_timeout_secs: 5,
			machine_id_path,
		}).unwrap()
	}

	fn camera() -> CameraRecord {
		CameraRecord {
			physical_address: Ipv4Addr::new(192, 168, 1, 64),
			hardware_address: "aa:bb:cc:00:00:02".to_string(),
			vendor_hint: "Hikvision".to_string(),
			model_hint: "Unknown".to_string(),
			stream_endpoint: Some("rtsp://192.168.1.64:554/live/main".to_string()),
			discovered_at: Utc::now(),
		}
	}

	#[test]
	fn machine_id_comes_from_the_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("machine-id");
		std::fs::write(&path, "  0123456789abcdef\n").unwrap();
		assert_eq!(resolve_machine_id(&path), "0123456789abcdef");
	}

	#[test]
	fn machine_id_falls_back_to_hostname() {
		let dir = tempfile::tempdir().unwrap();
		let id = resolve_machine_id(&dir.path().join("missing"));
		assert!(!id.is_empty());
		let expected = read_trimmed(Path::new(HOSTNAME_PATH)).unwrap_or_else(|| "unknown-host".to_string());
		assert_eq!(id, expected);
	}

	#[test]
	fn blank_machine_id_file_is_ignored() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("machine-id");
		std::fs::write(&path, "  \n").unwrap();
		assert_eq!(read_trimmed(&path), None);
		assert_ne!(resolve_machine_id(&path), "");
	}

	#[test]
	fn bad_entries_are_dropped() {
		let raw: ActivatedResponse = serde_json::from_str(r#"{
			"activated_cameras": [
				{"camera_id": "cam-1", "original_ip": "10.0.0.5", "name": "door"},
				{"camera_id": "cam-2"},
				{"original_ip": "10.0.0.7"},
				{"camera_id": "cam-3", "original_ip": "not-an-ip"},
				{"camera_id": "cam-4", "original_ip": "10.0.0.8", "port": 8554}
			]
		}"#).unwrap();

		let decisions: Vec<_> = raw.activated_cameras.into_iter().filter_map(RawDecision::into_decision).collect();
		assert_eq!(decisions, vec![
			ActivationDecision { camera_id: "cam-1".to_string(), original_address: Ipv4Addr::new(10, 0, 0, 5), port: None },
			ActivationDecision { camera_id: "cam-4".to_string(), original_address: Ipv4Addr::new(10, 0, 0, 8), port: Some(8554) },
		]);
	}

	#[tokio::test]
	async fn empty_registration_sends_nothing() {
		let dir = tempfile::tempdir().unwrap();
		// nothing listens here; a request would fail
		let client = client("http://127.0.0.1:9", &dir);
		assert!(client.register(&[]).await.is_ok());
	}

	#[tokio::test]
	async fn register_posts_cameras_with_bearer_key() {
		let dir = tempfile::tempdir().unwrap();
		let (url, request) = serve_once(200, "{}").await;
		let client = client(&url, &dir);

		client.register(&[camera()]).await.unwrap();

		let request = request.await.unwrap();
		assert!(request.starts_with("POST /api/cameras/register "));
		assert!(request.to_lowercase().contains("authorization: bearer key-1"));
		assert!(request.contains("\"machine_id\":\"abc123\""));
		assert!(request.contains("\"ip\":\"192.168.1.64\""));
	}

	#[tokio::test]
	async fn register_rejection_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let (url, _request) = serve_once(500, "boom").await;
		let client = client(&url, &dir);

		let result = client.register(&[camera()]).await;
		assert!(matches!(result, Err(PortalError::Status { status: 500, .. })));
	}

	#[tokio::test]
	async fn fetch_sends_machine_id_and_decodes_decisions() {
		let dir = tempfile::tempdir().unwrap();
		let (url, request) = serve_once(200, r#"{"activated_cameras":[{"camera_id":"cam-1","original_ip":"10.0.0.5"}]}"#).await;
		let client = client(&format!("{}/portal", url), &dir);

		let decisions = client.fetch_activated().await.unwrap();
		assert_eq!(decisions.len(), 1);
		assert_eq!(decisions[0].original_address, Ipv4Addr::new(10, 0, 0, 5));

		let request = request.await.unwrap();
		assert!(request.starts_with("GET /portal/api/cameras/activated?machine_id=abc123 "));
	}

	#[tokio::test]
	async fn fetch_failure_is_distinct_from_no_activations() {
		let dir = tempfile::tempdir().unwrap();
		let (url, _request) = serve_once(200, r#"{"activated_cameras":[]}"#).await;
		let empty = client(&url, &dir).fetch_activated().await;
		assert_eq!(empty.unwrap(), Vec::new());

		let (url, _request) = serve_once(503, "").await;
		let failed = client(&url, &dir).fetch_activated().await;
		assert!(failed.is_err());
	}
}
