use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};



pub type CameraId = String;
pub type CameraList = Vec<CameraRecord>;
pub type AssignmentMap = BTreeMap<CameraId, VirtualAssignment>;

pub const UNKNOWN_HINT: &str = "Unknown";

/// A device found on the local segment that looks like a camera.
#[derive(Clone)]
#[derive(Debug)]
#[derive(PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct CameraRecord {
	#[serde(rename = "ip")]
	pub physical_address: Ipv4Addr,
	#[serde(rename = "mac")]
	pub hardware_address: String,
	#[serde(rename = "vendor")]
	pub vendor_hint: String,
	#[serde(rename = "model")]
	pub model_hint: String,
	#[serde(rename = "rtsp_url")]
	pub stream_endpoint: Option<String>,
	pub discovered_at: DateTime<Utc>,
}

/// A locally allocated address standing in for one activated camera.
#[derive(Clone)]
#[derive(Debug)]
#[derive(PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct VirtualAssignment {
	pub camera_id: CameraId,
	#[serde(rename = "virtual_ip")]
	pub virtual_address: Ipv4Addr,
	#[serde(rename = "interface")]
	pub local_interface_label: String,
	pub base_interface: String,
	pub created_at: DateTime<Utc>,
}

/// The portal's instruction that a camera should be provisioned here.
#[derive(Clone)]
#[derive(Debug)]
#[derive(PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct ActivationDecision {
	pub camera_id: CameraId,
	#[serde(rename = "original_ip")]
	pub original_address: Ipv4Addr,
	#[serde(default)]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub port: Option<u16>,
}
