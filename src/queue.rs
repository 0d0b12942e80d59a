//! Capture queue contract: captured packets in, one verdict per packet out.

#[cfg(target_os = "linux")]
pub mod nfqueue;

use std::io;

use thiserror::Error;

/// Disposition returned for a captured packet.
///
/// Discriminants match the netfilter verdict codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Verdict {
    /// Discard the packet.
    Drop = 0,
    /// Let the packet continue its normal path.
    Accept = 1,
}

/// A packet delivered by the capture queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    /// Queue-assigned identifier used when submitting the verdict.
    pub id: u32,
    /// Raw IPv4 packet, starting at the IP header.
    pub data: Vec<u8>,
}

/// Errors raised by the capture queue binding.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Capture queue I/O error: {0}")]
    Io(#[from] io::Error),
    /// The kernel answered a request with a netlink error code.
    #[error("Netlink error {0}")]
    Netlink(i32),
    #[error("Malformed queue message: {0}")]
    Malformed(&'static str),
}

/// Accepts verdicts for captured packets.
///
/// Shared by every concurrently running handler, so implementations must be
/// safe to call from several threads at once.
pub trait VerdictSink: Send + Sync {
    /// Submits the verdict for packet `id`.
    fn set_verdict(&self, id: u32, verdict: Verdict) -> Result<(), QueueError>;
}
