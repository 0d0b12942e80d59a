//! Periodic probe emission for the initiator role.

use std::{
    net::SocketAddrV4,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    builder::{build, NetworkDescriptor, TransportDescriptor},
    headers::Protocol,
    stats::AckStats,
    telemetry::TelemetryPayload,
    time::now_epoch_secs,
    transmit::ResponderTransmitter,
};

/// Kind carried by every probe this prober emits.
pub const PROBE_KIND: i8 = 1;

/// Where probes go and which transport carries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTarget {
    pub protocol: Protocol,
    /// Local address and initiator port the probe is sent from.
    pub local: SocketAddrV4,
    /// Peer address and responder port.
    pub peer: SocketAddrV4,
}

/// Sends one probe per interval and registers each with the ack statistics.
pub struct Prober {
    target: ProbeTarget,
    interval: Duration,
    transmitter: ResponderTransmitter,
    stats: Arc<AckStats>,
    next_seq: AtomicU16,
}

impl Prober {
    pub fn new(
        target: ProbeTarget,
        interval: Duration,
        transmitter: ResponderTransmitter,
        stats: Arc<AckStats>,
    ) -> Self {
        Prober {
            target,
            interval,
            transmitter,
            stats,
            next_seq: AtomicU16::new(0),
        }
    }

    /// Returns the next sequence number, wrapping past `i16::MAX`.
    pub fn generate_sequence_number(&self) -> i16 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) as i16
    }

    /// Describes the probe with sequence `seq` sent at `now`.
    pub fn probe_descriptor(&self, seq: i16, now: i64) -> NetworkDescriptor {
        TransportDescriptor::new(
            self.target.protocol,
            self.target.local,
            self.target.peer,
            TelemetryPayload::probe(PROBE_KIND, seq, now),
        )
        .into()
    }

    /// Emits probes until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        log::info!(
            "Probing {} over {} every {:?} from {}",
            self.target.peer,
            self.target.protocol,
            self.interval,
            self.target.local
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.send_probe() {
                        break;
                    }
                }
            }
        }
        log::debug!("Prober stopped");
    }

    /// Sends one probe. Returns false once the transmitter is gone.
    fn send_probe(&self) -> bool {
        let seq = self.generate_sequence_number();
        let nd = self.probe_descriptor(seq, now_epoch_secs());
        let packet = match build(&nd) {
            Ok(packet) => packet,
            Err(e) => {
                log::error!("Cannot build probe seq={}: {}", seq, e);
                return true;
            }
        };

        self.stats.record_probe(seq, Instant::now());
        match self.transmitter.transmit(packet, self.target.peer) {
            Ok(()) => {
                log::debug!("Probe seq={} sent to {}", seq, self.target.peer);
                true
            }
            Err(e) => {
                log::error!("Probe seq={} not sent: {}", seq, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interceptor::{classify, Classification},
        transmit::RawSender,
    };
    use std::{io, sync::Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<(Vec<u8>, SocketAddrV4)>>>);

    impl RawSender for Capture {
        fn send_to(&mut self, packet: &[u8], dst: SocketAddrV4) -> io::Result<usize> {
            self.0.lock().unwrap().push((packet.to_vec(), dst));
            Ok(packet.len())
        }
    }

    fn target() -> ProbeTarget {
        ProbeTarget {
            protocol: Protocol::Udp,
            local: "10.0.0.1:10038".parse().unwrap(),
            peer: "10.0.0.2:10039".parse().unwrap(),
        }
    }

    #[test]
    fn test_sequence_wraps() {
        let (transmitter, _worker) = ResponderTransmitter::spawn(Capture::default()).unwrap();
        let prober = Prober::new(
            target(),
            Duration::from_secs(1),
            transmitter,
            Arc::new(AckStats::new()),
        );
        prober.next_seq.store(i16::MAX as u16, Ordering::Relaxed);
        assert_eq!(prober.generate_sequence_number(), i16::MAX);
        assert_eq!(prober.generate_sequence_number(), i16::MIN);
    }

    #[test]
    fn test_probe_descriptor() {
        let (transmitter, _worker) = ResponderTransmitter::spawn(Capture::default()).unwrap();
        let prober = Prober::new(
            target(),
            Duration::from_secs(1),
            transmitter,
            Arc::new(AckStats::new()),
        );
        let nd = prober.probe_descriptor(3, 1_700_000_000);
        let packet = build(&nd).unwrap();

        let Classification::Probe(flow, payload) = classify(&packet) else {
            panic!("probe not classified as a probe");
        };
        assert_eq!(payload.kind, PROBE_KIND);
        assert_eq!(payload.seq, 3);
        assert_eq!(payload.send_timestamp, 1_700_000_000);
        assert_eq!(flow.src, target().local);
        assert_eq!(flow.dst, target().peer);
    }

    #[tokio::test]
    async fn test_run_emits_and_registers_probes() {
        let capture = Capture::default();
        let (transmitter, worker) = ResponderTransmitter::spawn(capture.clone()).unwrap();
        let stats = Arc::new(AckStats::new());
        let prober = Prober::new(
            target(),
            Duration::from_millis(10),
            transmitter,
            Arc::clone(&stats),
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(prober.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(55)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        // The prober owned the last transmitter handle, so the worker drains and exits.
        worker.join().unwrap();

        let sent = stats.snapshot().probes_sent;
        assert!(sent >= 2, "only {} probes sent", sent);
        let captured = capture.0.lock().unwrap();
        assert_eq!(captured.len() as u64, sent);
        assert!(captured.iter().all(|(_, dst)| *dst == target().peer));
    }
}
