//! Side effects delegated to the outside world: operator alerts, network recovery and
//! liveness pings. The transports themselves (Telegram bots, healthcheck services, nmcli
//! scripts) are configured as external commands.
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::process::Command;
use std::time::Duration;

use super::config::Config;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Fire-and-forget alert to a human
pub trait Notifier {
    fn alert(&mut self, message: &str);
}

/// Connectivity check and local network reset
pub trait NetworkControl {
    fn is_online(&mut self) -> bool;
    fn reset(&mut self);
}

/// Liveness ping, sent once per successfully processed file
pub trait Heartbeat {
    fn ping(&mut self, message: &str);
}

/// Alerts that only go to the log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn alert(&mut self, message: &str) {
        spdlog::error!("ALERT: {message}");
    }
}

#[derive(Debug, Clone, Default)]
pub struct NoHeartbeat;

impl Heartbeat for NoHeartbeat {
    fn ping(&mut self, _message: &str) {}
}

/// An external program run with a message appended as its last argument.
///
/// Failures are logged and otherwise ignored.
#[derive(Debug, Clone)]
pub struct CommandHook {
    program: String,
    args: Vec<String>,
}

impl CommandHook {
    /// Build from a config argv. Returns None for an empty list.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// Start the command and return at once. The child is reaped on a detached thread so a
    /// hanging command never stalls the caller.
    fn run(&self, message: Option<&str>) {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(message) = message {
            command.arg(message);
        }
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                spdlog::warn!("Hook {} could not be run: {e}", self.program);
                return;
            }
        };
        let program = self.program.clone();
        std::thread::spawn(move || match child.wait() {
            Ok(status) if status.success() => (),
            Ok(status) => spdlog::warn!("Hook {program} exited with {status}"),
            Err(e) => spdlog::warn!("Hook {program} could not be waited on: {e}"),
        });
    }
}

impl Notifier for CommandHook {
    fn alert(&mut self, message: &str) {
        spdlog::error!("ALERT: {message}");
        self.run(Some(message));
    }
}

impl Heartbeat for CommandHook {
    fn ping(&mut self, message: &str) {
        self.run(Some(message));
    }
}

/// Checks connectivity by opening a TCP connection to a well known address, and resets the
/// network with an optional command
#[derive(Debug, Clone, Default)]
pub struct ProbeNetwork {
    probe: Option<SocketAddr>,
    reset_command: Option<CommandHook>,
}

impl ProbeNetwork {
    pub fn new(probe: Option<&str>, reset_command: Option<CommandHook>) -> Self {
        let probe = probe.and_then(|address| match address.to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                spdlog::warn!("Connectivity probe {address} is not a usable address: {e}");
                None
            }
        });
        Self {
            probe,
            reset_command,
        }
    }
}

impl NetworkControl for ProbeNetwork {
    /// Without a probe address the network is assumed up
    fn is_online(&mut self) -> bool {
        match self.probe {
            Some(address) => TcpStream::connect_timeout(&address, PROBE_TIMEOUT).is_ok(),
            None => true,
        }
    }

    fn reset(&mut self) {
        match &self.reset_command {
            Some(command) => {
                spdlog::warn!("Network appears to be down, resetting the interface");
                command.run(None);
            }
            None => spdlog::warn!("Network appears to be down and no reset command is configured"),
        }
    }
}

/// The collaborators named by a config
pub struct Hooks {
    pub notifier: Box<dyn Notifier>,
    pub network: Box<dyn NetworkControl>,
    pub heartbeat: Box<dyn Heartbeat>,
}

impl Hooks {
    pub fn from_config(config: &Config) -> Self {
        let command = |argv: &Option<Vec<String>>| argv.as_deref().and_then(CommandHook::from_argv);
        let notifier: Box<dyn Notifier> = match command(&config.alert_command) {
            Some(hook) => Box::new(hook),
            None => Box::new(LogNotifier),
        };
        let heartbeat: Box<dyn Heartbeat> = match command(&config.heartbeat_command) {
            Some(hook) => Box::new(hook),
            None => Box::new(NoHeartbeat),
        };
        let network = ProbeNetwork::new(
            config.connectivity_probe.as_deref(),
            command(&config.network_reset_command),
        );
        Self {
            notifier,
            network: Box::new(network),
            heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_hook_from_argv() {
        assert!(CommandHook::from_argv(&[]).is_none());
        let hook = CommandHook::from_argv(&["curl".to_string(), "-fsS".to_string()]).unwrap();
        assert_eq!(hook.program, "curl");
        assert_eq!(hook.args, vec!["-fsS".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_alert_command_does_not_block() {
        let argv: Vec<String> = ["sh", "-c", "sleep 3", "sh"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut hook = CommandHook::from_argv(&argv).unwrap();
        let start = std::time::Instant::now();
        hook.alert("store unreachable");
        hook.ping("file done");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_missing_program_is_only_logged() {
        let mut hook = CommandHook::from_argv(&["/nonexistent/caen_alert".to_string()]).unwrap();
        hook.alert("store unreachable");
    }

    #[test]
    fn test_network_without_check_address_is_online() {
        let mut network = ProbeNetwork::new(None, None);
        assert!(network.is_online());
        let mut network = ProbeNetwork::new(Some("not an address"), None);
        assert!(network.is_online());
    }

    #[test]
    fn test_network_check_reaches_local_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut network = ProbeNetwork::new(Some(&address), None);
        assert!(network.is_online());
    }
}
