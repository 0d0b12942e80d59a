//! Raw transmission of hand-built IPv4 packets.
//!
//! The raw handle is owned by a single transmit worker; handlers reach it
//! through a channel, so at most one send is ever in flight on the handle.

use std::{
    io,
    net::{IpAddr, SocketAddrV4},
    thread,
};

use pnet::{
    packet::{ip::IpNextHeaderProtocol, ipv4::Ipv4Packet},
    transport::{transport_channel, TransportChannelType, TransportSender},
};
use thiserror::Error;
use tokio::sync::mpsc;

/// IPPROTO_RAW: send-only raw socket, the IP header comes from the caller.
const IPPROTO_RAW: IpNextHeaderProtocol = IpNextHeaderProtocol(255);
const SEND_BUFFER_SIZE: usize = 4096;

/// Errors returned to callers handing packets to the transmitter.
#[derive(Error, Debug)]
pub enum TransmitError {
    /// The transmit worker has stopped.
    #[error("Transmit worker is no longer running")]
    WorkerGone,
}

/// Sends complete IPv4 packets, header included.
pub trait RawSender: Send + 'static {
    /// Sends `packet` to `dst`. The port is informational for raw sockets; the
    /// transport header inside `packet` already carries it.
    fn send_to(&mut self, packet: &[u8], dst: SocketAddrV4) -> io::Result<usize>;
}

/// [`RawSender`] backed by a pnet layer 3 transport channel.
pub struct PnetSender {
    tx: TransportSender,
}

impl PnetSender {
    /// Opens the raw socket. Requires CAP_NET_RAW.
    pub fn open() -> io::Result<Self> {
        let (tx, _) = transport_channel(
            SEND_BUFFER_SIZE,
            TransportChannelType::Layer3(IPPROTO_RAW),
        )?;
        Ok(PnetSender { tx })
    }
}

impl RawSender for PnetSender {
    fn send_to(&mut self, packet: &[u8], dst: SocketAddrV4) -> io::Result<usize> {
        let packet = Ipv4Packet::new(packet)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "packet too short"))?;
        self.tx.send_to(packet, IpAddr::V4(*dst.ip()))
    }
}

/// A packet queued for the transmit worker.
#[derive(Debug)]
struct Outbound {
    packet: Vec<u8>,
    dst: SocketAddrV4,
}

/// Cloneable handle to the transmit worker.
#[derive(Clone)]
pub struct ResponderTransmitter {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ResponderTransmitter {
    /// Moves `sender` onto a dedicated worker thread and returns a handle to it.
    ///
    /// The worker stops once every handle has been dropped.
    pub fn spawn<S: RawSender>(mut sender: S) -> io::Result<(Self, thread::JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let worker = thread::Builder::new()
            .name("raw-transmit".to_string())
            .spawn(move || {
                while let Some(out) = rx.blocking_recv() {
                    match sender.send_to(&out.packet, out.dst) {
                        Ok(n) => log::trace!("Sent {} bytes to {}", n, out.dst),
                        Err(e) => log::error!("Failed to send packet to {}: {}", out.dst, e),
                    }
                }
                log::debug!("Transmit worker stopped");
            })?;
        Ok((ResponderTransmitter { tx }, worker))
    }

    /// Queues `packet` for transmission to `dst`.
    ///
    /// Send failures on the raw handle are logged by the worker; they are not
    /// reported back.
    pub fn transmit(&self, packet: Vec<u8>, dst: SocketAddrV4) -> Result<(), TransmitError> {
        self.tx
            .send(Outbound { packet, dst })
            .map_err(|_| TransmitError::WorkerGone)
    }
}
