//! Packet interception: classify captured packets, answer probes, issue verdicts.
//!
//! One consumer task pulls packets from the capture queue. Packets that are not
//! probes get an immediate Accept from the consumer. Probes are handed to a
//! freshly spawned handler task, which does the role-specific work and then
//! drops the captured packet, so it never reaches the application it was
//! addressed to.
//!
//! Every captured packet gets exactly one verdict: the queue stalls otherwise.

use std::{
    net::SocketAddrV4,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use pnet::packet::{ipv4::Ipv4Packet, tcp::TcpPacket, udp::UdpPacket, Packet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    builder::{build, NetworkDescriptor, TransportDescriptor},
    headers::{CodecError, Protocol},
    queue::{CapturedPacket, Verdict, VerdictSink},
    roles::Role,
    stats::{AckTelemetry, TelemetrySink},
    telemetry::{PayloadError, PayloadType, ReceivedContext, TelemetryPayload},
    time::{now_epoch_secs, processing_time},
    transmit::{ResponderTransmitter, TransmitError},
};

/// Default idle interval of the consumer loop.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(20);

/// Transport addressing of a captured packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub protocol: Protocol,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

impl Flow {
    /// The same flow seen from the other end.
    pub fn reversed(&self) -> Flow {
        Flow {
            protocol: self.protocol,
            src: self.dst,
            dst: self.src,
        }
    }
}

/// What a captured packet turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Not an IPv4 TCP or UDP packet.
    PassThrough,
    /// TCP/UDP packet whose payload is not telemetry.
    Undecodable(Flow, PayloadError),
    /// Telemetry with a type tag other than the probe tag.
    Unrecognized(Flow, i16),
    /// A probe (or, on the initiator, an ack).
    Probe(Flow, TelemetryPayload),
}

/// Classifies a raw IPv4 packet.
pub fn classify(data: &[u8]) -> Classification {
    let Some(ip) = Ipv4Packet::new(data) else {
        return Classification::PassThrough;
    };
    if ip.get_version() != 4 {
        return Classification::PassThrough;
    }
    let Ok(protocol) = Protocol::try_from(ip.get_next_level_protocol()) else {
        return Classification::PassThrough;
    };

    let src = ip.get_source();
    let dst = ip.get_destination();
    let (flow, payload) = match protocol {
        Protocol::Tcp => {
            let Some(tcp) = TcpPacket::new(ip.payload()) else {
                return Classification::PassThrough;
            };
            let flow = Flow {
                protocol,
                src: SocketAddrV4::new(src, tcp.get_source()),
                dst: SocketAddrV4::new(dst, tcp.get_destination()),
            };
            (flow, TelemetryPayload::from_bytes(tcp.payload()))
        }
        Protocol::Udp => {
            let Some(udp) = UdpPacket::new(ip.payload()) else {
                return Classification::PassThrough;
            };
            let flow = Flow {
                protocol,
                src: SocketAddrV4::new(src, udp.get_source()),
                dst: SocketAddrV4::new(dst, udp.get_destination()),
            };
            (flow, TelemetryPayload::from_bytes(udp.payload()))
        }
    };

    match payload {
        Err(e) => Classification::Undecodable(flow, e),
        Ok(payload) => match payload.payload_type {
            PayloadType::Probe => Classification::Probe(flow, payload),
            PayloadType::Unrecognized(tag) => Classification::Unrecognized(flow, tag),
        },
    }
}

/// Builds the ack payload answering the probe in `ctx`, sent at `now`.
pub fn ack_payload(ctx: &ReceivedContext, now: i64) -> TelemetryPayload {
    let probe = &ctx.payload;
    TelemetryPayload {
        kind: probe.kind,
        payload_type: probe.payload_type,
        seq: probe.seq,
        dest_send_count: probe.dest_send_count.wrapping_add(1),
        dest_recv_count: probe.dest_recv_count.wrapping_add(1),
        processing_time: processing_time(ctx.received_at, now),
        send_timestamp: now,
        ..Default::default()
    }
}

/// Describes the ack for a probe captured on `flow`, addressed back at its origin.
pub fn ack_descriptor(flow: &Flow, ctx: &ReceivedContext, now: i64) -> NetworkDescriptor {
    let reply = flow.reversed();
    TransportDescriptor::new(reply.protocol, reply.src, reply.dst, ack_payload(ctx, now)).into()
}

/// Failure to answer a probe. Never affects the probe's verdict.
#[derive(Debug, thiserror::Error)]
enum AckError {
    #[error("{0}")]
    Codec(#[from] CodecError),
    #[error("{0}")]
    Transmit(#[from] TransmitError),
}

/// Aggregate packet counters for an interceptor.
#[derive(Default)]
pub struct InterceptorCounters {
    pub packets_captured: AtomicU64,
    pub packets_accepted: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub acks_sent: AtomicU64,
    pub ack_failures: AtomicU64,
    pub verdict_failures: AtomicU64,
}

enum Dispatch {
    Initiator(Arc<dyn TelemetrySink>),
    Responder(ResponderTransmitter),
}

/// Captured-packet dispatcher bound to one role.
pub struct Interceptor {
    dispatch: Dispatch,
    verdicts: Arc<dyn VerdictSink>,
    counters: Arc<InterceptorCounters>,
    idle_interval: Duration,
}

impl Interceptor {
    /// Creates an interceptor that answers probes through `transmitter`.
    pub fn responder(verdicts: Arc<dyn VerdictSink>, transmitter: ResponderTransmitter) -> Self {
        Self::new(Dispatch::Responder(transmitter), verdicts)
    }

    /// Creates an interceptor that feeds captured acks into `sink`.
    pub fn initiator(verdicts: Arc<dyn VerdictSink>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self::new(Dispatch::Initiator(sink), verdicts)
    }

    fn new(dispatch: Dispatch, verdicts: Arc<dyn VerdictSink>) -> Self {
        Interceptor {
            dispatch,
            verdicts,
            counters: Arc::new(InterceptorCounters::default()),
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }

    /// Sets how long the consumer waits for a packet before an idle pass.
    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    pub fn role(&self) -> Role {
        match self.dispatch {
            Dispatch::Initiator(_) => Role::Initiator,
            Dispatch::Responder(_) => Role::Responder,
        }
    }

    pub fn counters(&self) -> Arc<InterceptorCounters> {
        Arc::clone(&self.counters)
    }

    /// Consumes captured packets until `shutdown` is cancelled or the queue closes.
    ///
    /// Dropping `packets` on return releases the capture queue. Handlers still
    /// running are left to finish on their own.
    pub async fn run(self, mut packets: mpsc::Receiver<CapturedPacket>, shutdown: CancellationToken) {
        log::info!("Interceptor running as {}", self.role());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Interceptor shutting down");
                    break;
                }
                packet = packets.recv() => match packet {
                    Some(packet) => self.handle(packet),
                    None => {
                        log::warn!("Capture queue closed");
                        break;
                    }
                },
                _ = tokio::time::sleep(self.idle_interval) => {
                    log::trace!("Interceptor idle");
                }
            }
        }

        let c = &self.counters;
        log::info!(
            "Interceptor stopped: captured={} accepted={} dropped={} acks_sent={} ack_failures={} verdict_failures={}",
            c.packets_captured.load(Ordering::Relaxed),
            c.packets_accepted.load(Ordering::Relaxed),
            c.packets_dropped.load(Ordering::Relaxed),
            c.acks_sent.load(Ordering::Relaxed),
            c.ack_failures.load(Ordering::Relaxed),
            c.verdict_failures.load(Ordering::Relaxed),
        );
    }

    fn handle(&self, packet: CapturedPacket) {
        let received_at = now_epoch_secs();
        self.counters.packets_captured.fetch_add(1, Ordering::Relaxed);

        let (flow, payload) = match classify(&packet.data) {
            Classification::PassThrough => {
                log::trace!("Packet {}: not TCP/UDP, accepting", packet.id);
                return self.accept(packet.id);
            }
            Classification::Undecodable(flow, e) => {
                log::warn!(
                    "Packet {} {} -> {}: {}, accepting",
                    packet.id,
                    flow.src,
                    flow.dst,
                    e
                );
                return self.accept(packet.id);
            }
            Classification::Unrecognized(flow, tag) => {
                log::debug!(
                    "Packet {} {} -> {}: type tag {} not a probe, accepting",
                    packet.id,
                    flow.src,
                    flow.dst,
                    tag
                );
                return self.accept(packet.id);
            }
            Classification::Probe(flow, payload) => (flow, payload),
        };

        log::debug!(
            "Packet {} {} {} -> {}: seq={} send_ts={}",
            packet.id,
            flow.protocol,
            flow.src,
            flow.dst,
            payload.seq,
            payload.send_timestamp
        );
        let ctx = ReceivedContext {
            payload,
            received_at,
        };
        let id = packet.id;
        let verdicts = Arc::clone(&self.verdicts);
        let counters = Arc::clone(&self.counters);

        match &self.dispatch {
            Dispatch::Responder(transmitter) => {
                let transmitter = transmitter.clone();
                tokio::spawn(async move {
                    match send_ack(&transmitter, &flow, &ctx) {
                        Ok(()) => counters.acks_sent.fetch_add(1, Ordering::Relaxed),
                        Err(e) => {
                            log::error!("Ack to {} abandoned: {}", flow.src, e);
                            counters.ack_failures.fetch_add(1, Ordering::Relaxed)
                        }
                    };
                    submit(&*verdicts, &counters, id, Verdict::Drop);
                });
            }
            Dispatch::Initiator(sink) => {
                let sink = Arc::clone(sink);
                tokio::spawn(async move {
                    sink.record_ack(extract_ack(&flow, &ctx));
                    submit(&*verdicts, &counters, id, Verdict::Drop);
                });
            }
        }
    }

    fn accept(&self, id: u32) {
        submit(&*self.verdicts, &self.counters, id, Verdict::Accept);
    }
}

fn send_ack(
    transmitter: &ResponderTransmitter,
    flow: &Flow,
    ctx: &ReceivedContext,
) -> Result<(), AckError> {
    let nd = ack_descriptor(flow, ctx, now_epoch_secs());
    let packet = build(&nd)?;
    let td = &nd.transport;
    log::debug!(
        "Ack {}:{} -> {}:{} seq={} processing={} send_ts={}",
        td.src,
        td.src_port,
        td.dst,
        td.dst_port,
        td.payload.seq,
        td.payload.processing_time,
        td.payload.send_timestamp
    );
    transmitter.transmit(packet, td.destination())?;
    Ok(())
}

fn extract_ack(flow: &Flow, ctx: &ReceivedContext) -> AckTelemetry {
    let ack = &ctx.payload;
    AckTelemetry {
        protocol: flow.protocol,
        peer: flow.src,
        seq: ack.seq,
        processing_time: ack.processing_time,
        dest_send_count: ack.dest_send_count,
        dest_recv_count: ack.dest_recv_count,
        peer_send_timestamp: ack.send_timestamp,
        received_at: ctx.received_at,
    }
}

fn submit(verdicts: &dyn VerdictSink, counters: &InterceptorCounters, id: u32, verdict: Verdict) {
    match verdict {
        Verdict::Accept => counters.packets_accepted.fetch_add(1, Ordering::Relaxed),
        Verdict::Drop => counters.packets_dropped.fetch_add(1, Ordering::Relaxed),
    };
    if let Err(e) = verdicts.set_verdict(id, verdict) {
        counters.verdict_failures.fetch_add(1, Ordering::Relaxed);
        log::error!("Verdict {:?} for packet {} failed: {}", verdict, id, e);
    }
}
