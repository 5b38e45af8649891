//! Scripted stand-ins for the network tool, portal and web probe.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::common::{ActivationDecision, CameraList, CameraRecord};
use crate::discovery::WebProbe;
use crate::error::{PortalError, ToolError};
use crate::network_tool::{NetworkTool, RedirectRule, ToolOutput};
use crate::portal::PortalApi;



#[derive(Clone)]
#[derive(Copy)]
#[derive(Debug)]
#[derive(PartialEq, Eq, Hash)]
pub enum Step {
	Scan,
	AddAddress,
	LinkUp,
	RemoveAddress,
	InstallRule,
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(PartialEq)]
pub enum ToolCall {
	Scan(String),
	AddAddress { address: Ipv4Addr, prefix_len: u8, base_interface: String, label: String },
	LinkUp(String),
	RemoveAddress { address: Ipv4Addr, label: String },
	InstallRule(RedirectRule),
}

impl ToolCall {
	fn step(&self) -> Step {
		match self {
			ToolCall::Scan(_) => Step::Scan,
			ToolCall::AddAddress { .. } => Step::AddAddress,
			ToolCall::LinkUp(_) => Step::LinkUp,
			ToolCall::RemoveAddress { .. } => Step::RemoveAddress,
			ToolCall::InstallRule(_) => Step::InstallRule,
		}
	}
}

/// Records every call. Steps marked with `fail` exit non-zero, steps marked
/// with `break_step` cannot be run at all.
#[derive(Default)]
pub struct FakeNetworkTool {
	calls: Mutex<Vec<ToolCall>>,
	failing: Mutex<HashSet<Step>>,
	broken: Mutex<HashSet<Step>>,
	scan_output: String,
}

impl FakeNetworkTool {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_scan_output(mut self, output: &str) -> Self {
		self.scan_output = output.to_string();
		self
	}

	pub fn fail(&self, step: Step) {
		self.failing.lock().unwrap().insert(step);
	}

	pub fn break_step(&self, step: Step) {
		self.broken.lock().unwrap().insert(step);
	}

	pub fn calls(&self) -> Vec<ToolCall> {
		self.calls.lock().unwrap().clone()
	}

	pub fn count(&self, step: Step) -> usize {
		self.calls.lock().unwrap().iter().filter(|call| call.step() == step).count()
	}

	fn record(&self, call: ToolCall, output: &str) -> Result<ToolOutput, ToolError> {
		let step = call.step();
		self.calls.lock().unwrap().push(call);
		if self.broken.lock().unwrap().contains(&step) {
			return Err(ToolError::Timeout { command: format!("{:?}", step), timeout: Duration::from_secs(15) });
		}
		if self.failing.lock().unwrap().contains(&step) {
			return Ok(ToolOutput::failed(format!("{:?} failed", step)));
		}
		Ok(ToolOutput::ok(output))
	}
}

#[async_trait::async_trait]
impl NetworkTool for FakeNetworkTool {
	async fn scan(&self, interface: &str) -> Result<ToolOutput, ToolError> {
		self.record(ToolCall::Scan(interface.to_string()), &self.scan_output)
	}

	async fn add_address(&self, address: Ipv4Addr, prefix_len: u8, base_interface: &str, label: &str) -> Result<ToolOutput, ToolError> {
		self.record(ToolCall::AddAddress {
			address,
			prefix_len,
			base_interface: base_interface.to_string(),
			label: label.to_string(),
		}, "")
	}

	async fn link_up(&self, label: &str) -> Result<ToolOutput, ToolError> {
		self.record(ToolCall::LinkUp(label.to_string()), "")
	}

	async fn remove_address(&self, address: Ipv4Addr, _prefix_len: u8, _base_interface: &str, label: &str) -> Result<ToolOutput, ToolError> {
		self.record(ToolCall::RemoveAddress { address, label: label.to_string() }, "")
	}

	async fn install_rule(&self, rule: &RedirectRule) -> Result<ToolOutput, ToolError> {
		self.record(ToolCall::InstallRule(*rule), "")
	}
}

/// Answers `fetch_activated` with a fixed list, or fails when there is none.
pub struct FakePortal {
	activations: Mutex<Option<Vec<ActivationDecision>>>,
	reject_registration: bool,
	registrations: Mutex<Vec<CameraList>>,
	fetches: Mutex<usize>,
}

impl FakePortal {
	pub fn new() -> Self {
		Self {
			activations: Mutex::new(Some(Vec::new())),
			reject_registration: false,
			registrations: Mutex::new(Vec::new()),
			fetches: Mutex::new(0),
		}
	}

	pub fn with_activations(self, decisions: Vec<ActivationDecision>) -> Self {
		*self.activations.lock().unwrap() = Some(decisions);
		self
	}

	pub fn rejecting_registration(mut self) -> Self {
		self.reject_registration = true;
		self
	}

	pub fn set_activations(&self, decisions: Option<Vec<ActivationDecision>>) {
		*self.activations.lock().unwrap() = decisions;
	}

	pub fn registrations(&self) -> Vec<CameraList> {
		self.registrations.lock().unwrap().clone()
	}

	pub fn fetch_count(&self) -> usize {
		*self.fetches.lock().unwrap()
	}
}

#[async_trait::async_trait]
impl PortalApi for FakePortal {
	async fn register(&self, cameras: &[CameraRecord]) -> Result<(), PortalError> {
		self.registrations.lock().unwrap().push(cameras.to_vec());
		if self.reject_registration {
			return Err(PortalError::Status { status: 500, body: "rejected".to_string() });
		}
		Ok(())
	}

	async fn fetch_activated(&self) -> Result<Vec<ActivationDecision>, PortalError> {
		*self.fetches.lock().unwrap() += 1;
		match self.activations.lock().unwrap().clone() {
			Some(decisions) => Ok(decisions),
			None => Err(PortalError::Status { status: 503, body: "unavailable".to_string() }),
		}
	}
}

/// Serves fixed pages; everything else gets no answer.
#[derive(Default)]
pub struct FakeProbe {
	pages: HashMap<(Ipv4Addr, u16), String>,
	tried: Mutex<Vec<u16>>,
}

impl FakeProbe {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_page(mut self, address: Ipv4Addr, port: u16, page: &str) -> Self {
		self.pages.insert((address, port), page.to_string());
		self
	}

	pub fn ports_tried(&self) -> Vec<u16> {
		self.tried.lock().unwrap().clone()
	}
}

#[async_trait::async_trait]
impl WebProbe for FakeProbe {
	async fn fetch_page(&self, address: Ipv4Addr, port: u16) -> Option<String> {
		self.tried.lock().unwrap().push(port);
		self.pages.get(&(address, port)).cloned()
	}
}

/// Answers one HTTP request with `status` and `body`; the handle yields the raw request.
pub async fn serve_once(status: u16, body: &str) -> (String, JoinHandle<String>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let url = format!("http://{}", listener.local_addr().unwrap());
	let body = body.to_string();

	let handle = tokio::spawn(async move {
		let (mut socket, _) = listener.accept().await.unwrap();
		let request = read_request(&mut socket).await;
		let response = format!(
			"HTTP/1.1 {} Fake\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
			status, body.len(), body
		);
		socket.write_all(response.as_bytes()).await.unwrap();
		let _ = socket.shutdown().await;
		request
	});

	(url, handle)
}

async fn read_request(socket: &mut TcpStream) -> String {
	let mut data = Vec::new();
	let mut buf = [0u8; 4096];
	loop {
		let n = socket.read(&mut buf).await.unwrap();
		if n == 0 {
			break;
		}
		data.extend_from_slice(&buf[..n]);

		if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
			let headers = String::from_utf8_lossy(&data[..end]).to_lowercase();
			let length = headers.lines()
				.find_map(|line| line.strip_prefix("content-length:"))
				.and_then(|value| value.trim().parse::<usize>().ok())
				.unwrap_or(0);
			if data.len() >= end + 4 + length {
				break;
			}
		}
	}
	String::from_utf8_lossy(&data).into_owned()
}
