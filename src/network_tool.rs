use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use log::debug;
use tokio::process::Command;

use crate::config::ToolConfig;
use crate::error::ToolError;



/// What a network command reported when it ran.
#[derive(Clone)]
#[derive(Debug)]
#[derive(PartialEq)]
pub struct ToolOutput {
	pub success: bool,
	/// Stdout on success, stderr (or stdout if stderr was empty) on failure.
	pub output: String,
}

impl ToolOutput {
	pub fn ok(output: impl Into<String>) -> Self {
		Self { success: true, output: output.into() }
	}

	pub fn failed(output: impl Into<String>) -> Self {
		Self { success: false, output: output.into() }
	}
}

/// One of the packet-filter rules that make a virtual address forward to a camera.
#[derive(Clone)]
#[derive(Copy)]
#[derive(Debug)]
#[derive(PartialEq)]
pub enum RedirectRule {
	/// Rewrite the destination of traffic sent to the virtual address.
	Dnat { virtual_address: Ipv4Addr, target: Ipv4Addr, port: u16 },
	/// Masquerade traffic coming back from the camera.
	Masquerade { target: Ipv4Addr },
	AcceptInbound { target: Ipv4Addr, port: u16 },
	AcceptOutbound { target: Ipv4Addr, port: u16 },
}

impl RedirectRule {
	/// The four rules, in installation order.
	pub fn for_redirect(virtual_address: Ipv4Addr, target: Ipv4Addr, port: u16) -> [RedirectRule; 4] {
		[
			RedirectRule::Dnat { virtual_address, target, port },
			RedirectRule::Masquerade { target },
			RedirectRule::AcceptInbound { target, port },
			RedirectRule::AcceptOutbound { target, port },
		]
	}

	pub fn iptables_args(&self) -> Vec<String> {
		let args = match *self {
			RedirectRule::Dnat { virtual_address, target, port } => format!(
				"-t nat -A PREROUTING -d {} -p tcp --dport {} -j DNAT --to-destination {}:{}",
				virtual_address, port, target, port
			),
			RedirectRule::Masquerade { target } => format!(
				"-t nat -A POSTROUTING -s {} -j MASQUERADE",
				target
			),
			RedirectRule::AcceptInbound { target, port } => format!(
				"-A FORWARD -d {} -p tcp --dport {} -j ACCEPT",
				target, port
			),
			RedirectRule::AcceptOutbound { target, port } => format!(
				"-A FORWARD -s {} -p tcp --sport {} -j ACCEPT",
				target, port
			),
		};
		args.split_whitespace().map(str::to_string).collect()
	}
}

impl fmt::Display for RedirectRule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "iptables {}", self.iptables_args().join(" "))
	}
}

/// The privileged network operations the manager depends on.
///
/// `Err` means the command could not be run to completion; a command that ran
/// and failed is `Ok` with `success == false`.
#[async_trait::async_trait]
pub trait NetworkTool: Send + Sync {
	/// Lists devices answering on the segment, in arp-scan's tab-separated format.
	async fn scan(&self, interface: &str) -> Result<ToolOutput, ToolError>;

	async fn add_address(&self, address: Ipv4Addr, prefix_len: u8, base_interface: &str, label: &str) -> Result<ToolOutput, ToolError>;

	async fn link_up(&self, label: &str) -> Result<ToolOutput, ToolError>;

	async fn remove_address(&self, address: Ipv4Addr, prefix_len: u8, base_interface: &str, label: &str) -> Result<ToolOutput, ToolError>;

	async fn install_rule(&self, rule: &RedirectRule) -> Result<ToolOutput, ToolError>;
}

/// Runs `arp-scan`, `ip` and `iptables` on the local machine.
pub struct SystemNetworkTool {
	timeout: Duration,
	use_sudo: bool,
}

impl SystemNetworkTool {
	pub fn new(config: &ToolConfig) -> Self {
		Self {
			timeout: Duration::from_secs(config.command_timeout_secs),
			use_sudo: config.use_sudo,
		}
	}

	async fn run(&self, program: &str, args: Vec<String>) -> Result<ToolOutput, ToolError> {
		let mut argv: Vec<String> = Vec::with_capacity(args.len() + 2);
		if self.use_sudo {
			argv.push("sudo".to_string());
		}
		argv.push(program.to_string());
		argv.extend(args);
		let command_line = argv.join(" ");
		debug!("Running `{}`", command_line);

		let mut command = Command::new(&argv[0]);
		command.args(&argv[1..]).kill_on_drop(true);

		// Dropping the future on timeout kills the child.
		let output = match tokio::time::timeout(self.timeout, command.output()).await {
			Ok(Ok(output)) => output,
			Ok(Err(source)) => return Err(ToolError::Spawn { command: command_line, source }),
			Err(_) => return Err(ToolError::Timeout { command: command_line, timeout: self.timeout }),
		};

		let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
		if output.status.success() {
			return Ok(ToolOutput::ok(stdout));
		}
		let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
		Ok(ToolOutput::failed(if stderr.is_empty() { stdout } else { stderr }))
	}
}

#[async_trait::async_trait]
impl NetworkTool for SystemNetworkTool {
	async fn scan(&self, interface: &str) -> Result<ToolOutput, ToolError> {
		let args = vec![
			"--localnet".to_string(),
			format!("--interface={}", interface),
			"--quiet".to_string(),
		];
		self.run("arp-scan", args).await
	}

	async fn add_address(&self, address: Ipv4Addr, prefix_len: u8, base_interface: &str, label: &str) -> Result<ToolOutput, ToolError> {
		self.run("ip", address_args("add", address, prefix_len, base_interface, label)).await
	}

	async fn link_up(&self, label: &str) -> Result<ToolOutput, ToolError> {
		let args = ["link", "set", label, "up"];
		self.run("ip", args.iter().map(|a| a.to_string()).collect()).await
	}

	async fn remove_address(&self, address: Ipv4Addr, prefix_len: u8, base_interface: &str, label: &str) -> Result<ToolOutput, ToolError> {
		self.run("ip", address_args("del", address, prefix_len, base_interface, label)).await
	}

	async fn install_rule(&self, rule: &RedirectRule) -> Result<ToolOutput, ToolError> {
		self.run("iptables", rule.iptables_args()).await
	}
}

fn address_args(verb: &str, address: Ipv4Addr, prefix_len: u8, base_interface: &str, label: &str) -> Vec<String> {
	vec![
		"addr".to_string(),
		verb.to_string(),
		format!("{}/{}", address, prefix_len),
		"dev".to_string(),
		base_interface.to_string(),
		"label".to_string(),
		label.to_string(),
	]
}



#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn redirect_rules_come_in_install_order() {
		let rules = RedirectRule::for_redirect(
			Ipv4Addr::new(192, 168, 1, 200),
			Ipv4Addr::new(10, 0, 0, 5),
			554,
		);

		assert_eq!(
			rules[0].iptables_args().join(" "),
			"-t nat -A PREROUTING -d 192.168.1.200 -p tcp --dport 554 -j DNAT --to-destination 10.0.0.5:554"
		);
		assert_eq!(rules[1].iptables_args().join(" "), "-t nat -A POSTROUTING -s 10.0.0.5 -j MASQUERADE");
		assert_eq!(rules[2].iptables_args().join(" "), "-A FORWARD -d 10.0.0.5 -p tcp --dport 554 -j ACCEPT");
		assert_eq!(rules[3].iptables_args().join(" "), "-A FORWARD -s 10.0.0.5 -p tcp --sport 554 -j ACCEPT");
	}

	#[test]
	fn address_commands_carry_prefix_and_label() {
		let args = address_args("add", Ipv4Addr::new(192, 168, 1, 201), 24, "eth0", "eth0:cam1");
		assert_eq!(args.join(" "), "addr add 192.168.1.201/24 dev eth0 label eth0:cam1");
	}

	#[tokio::test]
	async fn missing_program_is_a_spawn_error() {
		let tool = SystemNetworkTool {
			timeout: Duration::from_secs(5),
			use_sudo: false,
		};
		let result = tool.run("definitely-not-a-real-network-tool", Vec::new()).await;
		assert!(matches!(result, Err(ToolError::Spawn { .. })));
	}

	#[tokio::test]
	async fn hung_command_times_out() {
		let tool = SystemNetworkTool {
			timeout: Duration::from_millis(100),
			use_sudo: false,
		};
		let result = tool.run("sleep", vec!["5".to_string()]).await;
		match result {
			Err(err @ ToolError::Timeout { .. }) => assert_eq!(err.to_string(), "`sleep 5` did not finish within 100ms"),
			other => panic!("unexpected result: {:?}", other),
		}
	}

	#[tokio::test]
	async fn non_zero_exit_is_reported_not_raised() {
		let tool = SystemNetworkTool {
			timeout: Duration::from_secs(5),
			use_sudo: false,
		};
		let output = tool.run("false", Vec::new()).await.unwrap();
		assert!(!output.success);
	}
}
