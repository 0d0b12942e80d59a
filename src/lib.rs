//! Queue Latency - probe/ack latency measurement over a kernel packet queue.
//!
//! Probe traffic is steered into an NFQUEUE by iptables. The responder answers
//! every captured probe with a hand-built ack carrying its processing delay and
//! drops the probe; the initiator sends probes and collects the acks.
//!
//! # Usage
//!
//! Run as a responder:
//! ```bash
//! queue-latency --role responder
//! ```
//!
//! Run as an initiator probing 10.0.0.2:
//! ```bash
//! queue-latency --role initiator --local-addr 10.0.0.1 --peer-addr 10.0.0.2
//! ```

/// Packet assembly from transport descriptors.
pub mod builder;
/// Command-line configuration and validation.
pub mod configuration;
/// IPv4/TCP/UDP header encoding and the Internet checksum.
pub mod headers;
/// Captured packet classification and role dispatch.
pub mod interceptor;
/// Initiator-side probe emission.
pub mod prober;
/// Capture queue contract and the Linux NFQUEUE binding.
pub mod queue;
/// Initiator/responder roles.
pub mod roles;
/// iptables rule provisioning.
pub mod rules;
/// Ack telemetry collection and statistics output.
pub mod stats;
/// Telemetry payload wire format.
pub mod telemetry;
/// Timestamp utilities.
pub mod time;
/// Serialized raw packet transmission.
pub mod transmit;
