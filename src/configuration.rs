pub use clap::Parser;

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use thiserror::Error;

use crate::{headers::Protocol, prober::ProbeTarget, roles::Role, stats::OutputFormat};

/// Port the initiator sends probes from and receives acks on.
pub const DEFAULT_INITIATOR_PORT: u16 = 10038;
/// Port the responder receives probes on.
pub const DEFAULT_RESPONDER_PORT: u16 = 10039;
pub const DEFAULT_INITIATOR_QUEUE: u16 = 1048;
pub const DEFAULT_RESPONDER_QUEUE: u16 = 1049;
pub const DEFAULT_QUEUE_MAX_LEN: u32 = 10240;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Initiator and responder ports must differ (both {0})")]
    SamePorts(u16),
    #[error("Idle interval must be greater than zero")]
    ZeroIdleInterval,
    #[error("Probe interval must be greater than zero")]
    ZeroProbeInterval,
    #[error("Copy range must be greater than zero")]
    ZeroCopyRange,
    #[error("--peer-addr is only valid for the initiator role")]
    PeerOnResponder,
    #[error("--peer-addr requires --local-addr")]
    MissingLocalAddr,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Queue-based probe responder and latency initiator", long_about = None)]
pub struct Configuration {
    /// Role of this process
    #[arg(short, long, value_enum, default_value_t = Role::Responder)]
    pub role: Role,
    /// Capture queue number (defaults to 1048 for the initiator, 1049 for the responder)
    #[arg(short, long)]
    pub queue_num: Option<u16>,
    /// Maximum number of packets the kernel holds in the queue
    #[arg(long, default_value_t = DEFAULT_QUEUE_MAX_LEN)]
    pub queue_max_len: u32,
    /// Bytes of each packet copied to user space
    #[arg(long, default_value_t = 0xffff)]
    pub copy_range: u32,
    /// Initiator port
    #[arg(long, default_value_t = DEFAULT_INITIATOR_PORT)]
    pub initiator_port: u16,
    /// Responder port
    #[arg(long, default_value_t = DEFAULT_RESPONDER_PORT)]
    pub responder_port: u16,
    /// Idle wait of the consumer loop, in milliseconds
    #[arg(long, default_value_t = 20)]
    pub idle_interval_ms: u64,
    /// Do not install iptables rules
    #[arg(long, default_value_t = false)]
    pub skip_rules: bool,
    /// Responder to probe (initiator only)
    #[arg(short, long)]
    pub peer_addr: Option<Ipv4Addr>,
    /// Local source address of probes
    #[arg(short, long)]
    pub local_addr: Option<Ipv4Addr>,
    /// Transport carrying probes
    #[arg(long, value_enum, default_value_t = Protocol::Udp)]
    pub probe_protocol: Protocol,
    /// Interval between probes, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub probe_interval_ms: u64,
    /// Format of the statistics printed on exit
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.initiator_port == self.responder_port {
            return Err(ConfigurationError::SamePorts(self.initiator_port));
        }
        if self.idle_interval_ms == 0 {
            return Err(ConfigurationError::ZeroIdleInterval);
        }
        if self.probe_interval_ms == 0 {
            return Err(ConfigurationError::ZeroProbeInterval);
        }
        if self.copy_range == 0 {
            return Err(ConfigurationError::ZeroCopyRange);
        }
        if self.peer_addr.is_some() {
            if self.role == Role::Responder {
                return Err(ConfigurationError::PeerOnResponder);
            }
            if self.local_addr.is_none() {
                return Err(ConfigurationError::MissingLocalAddr);
            }
        }
        Ok(())
    }

    /// Queue number, falling back to the role's default.
    pub fn queue_num(&self) -> u16 {
        self.queue_num.unwrap_or(match self.role {
            Role::Initiator => DEFAULT_INITIATOR_QUEUE,
            Role::Responder => DEFAULT_RESPONDER_QUEUE,
        })
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// True when this process transmits: the responder sends acks, the
    /// initiator sends only when it has a probe target.
    pub fn needs_raw_socket(&self) -> bool {
        self.role == Role::Responder || self.probe_target().is_some()
    }

    /// Probe target when this process should emit probes.
    pub fn probe_target(&self) -> Option<ProbeTarget> {
        let peer = self.peer_addr?;
        let local = self.local_addr?;
        Some(ProbeTarget {
            protocol: self.probe_protocol,
            local: SocketAddrV4::new(local, self.initiator_port),
            peer: SocketAddrV4::new(peer, self.responder_port),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_configuration_correct_test() {
        let conf = Configuration::parse_from(["queue-latency"]);
        assert_eq!(conf.validate(), Ok(()));
        assert_eq!(conf.role, Role::Responder);
        assert_eq!(conf.queue_num(), DEFAULT_RESPONDER_QUEUE);
        assert_eq!(conf.queue_max_len, 10240);
        assert_eq!(conf.idle_interval(), Duration::from_millis(20));
        assert!(conf.probe_target().is_none());
    }

    #[test]
    fn validate_configuration_incorrect_test() {
        let conf = Configuration::parse_from([
            "queue-latency",
            "--initiator-port",
            "7000",
            "--responder-port",
            "7000",
        ]);
        assert_eq!(conf.validate(), Err(ConfigurationError::SamePorts(7000)));

        let conf = Configuration::parse_from(["queue-latency", "--idle-interval-ms", "0"]);
        assert_eq!(conf.validate(), Err(ConfigurationError::ZeroIdleInterval));

        let conf = Configuration::parse_from(["queue-latency", "--probe-interval-ms", "0"]);
        assert_eq!(conf.validate(), Err(ConfigurationError::ZeroProbeInterval));

        let conf = Configuration::parse_from(["queue-latency", "--peer-addr", "10.0.0.2"]);
        assert_eq!(conf.validate(), Err(ConfigurationError::PeerOnResponder));

        let conf = Configuration::parse_from([
            "queue-latency",
            "--role",
            "initiator",
            "--peer-addr",
            "10.0.0.2",
        ]);
        assert_eq!(conf.validate(), Err(ConfigurationError::MissingLocalAddr));
    }

    #[test]
    fn initiator_probe_target_test() {
        let conf = Configuration::parse_from([
            "queue-latency",
            "--role",
            "initiator",
            "--peer-addr",
            "10.0.0.2",
            "--local-addr",
            "10.0.0.1",
            "--probe-protocol",
            "tcp",
        ]);
        assert_eq!(conf.validate(), Ok(()));
        assert_eq!(conf.queue_num(), DEFAULT_INITIATOR_QUEUE);

        let target = conf.probe_target().unwrap();
        assert_eq!(target.protocol, Protocol::Tcp);
        assert_eq!(target.local, "10.0.0.1:10038".parse().unwrap());
        assert_eq!(target.peer, "10.0.0.2:10039".parse().unwrap());
    }

    #[test]
    fn raw_socket_only_when_transmitting_test() {
        let responder = Configuration::parse_from(["queue-latency"]);
        assert!(responder.needs_raw_socket());

        let passive = Configuration::parse_from(["queue-latency", "--role", "initiator"]);
        assert_eq!(passive.validate(), Ok(()));
        assert!(!passive.needs_raw_socket());

        let active = Configuration::parse_from([
            "queue-latency",
            "--role",
            "initiator",
            "--peer-addr",
            "10.0.0.2",
            "--local-addr",
            "10.0.0.1",
        ]);
        assert!(active.needs_raw_socket());
    }

    #[test]
    fn explicit_queue_num_test() {
        let conf = Configuration::parse_from(["queue-latency", "-q", "7"]);
        assert_eq!(conf.queue_num(), 7);
    }
}
