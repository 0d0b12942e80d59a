//! Ack telemetry collection on the initiator side.
//!
//! Acks carry the responder's processing delay and counters. When the probe an
//! ack answers was sent by this process, its local send instant is known and a
//! round-trip time is recorded as well.

use std::{
    collections::HashMap,
    net::SocketAddrV4,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::headers::Protocol;

/// Output format for the shutdown summary.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for machine consumption.
    Json,
}

/// Telemetry extracted from one captured ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckTelemetry {
    pub protocol: Protocol,
    /// Responder address (source of the ack).
    pub peer: SocketAddrV4,
    pub seq: i16,
    /// Responder processing delay in seconds.
    pub processing_time: i32,
    pub dest_send_count: i16,
    pub dest_recv_count: i16,
    /// Responder clock when the ack left (Unix seconds).
    pub peer_send_timestamp: i64,
    /// Local clock when the ack was captured (Unix seconds).
    pub received_at: i64,
}

impl AckTelemetry {
    /// One-way delay estimate from the two clocks; meaningful only with synchronized hosts.
    pub fn one_way_secs(&self) -> i64 {
        self.received_at.saturating_sub(self.peer_send_timestamp)
    }
}

/// Receives telemetry extracted from acks.
pub trait TelemetrySink: Send + Sync {
    /// Records one ack.
    fn record_ack(&self, ack: AckTelemetry);
}

/// Pending probes older than this are forgotten.
const PENDING_TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Inner {
    pending: HashMap<i16, Instant>,
    acks_received: u64,
    acks_matched: u64,
    probes_sent: u64,
    rtt_min_ns: Option<u64>,
    rtt_max_ns: Option<u64>,
    rtt_sum_ns: u128,
    proc_min: Option<i32>,
    proc_max: Option<i32>,
}

/// Default [`TelemetrySink`]: running counters and RTT aggregates.
#[derive(Default)]
pub struct AckStats {
    inner: Mutex<Inner>,
}

impl AckStats {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers when probe `seq` was sent so its ack can be timed.
    pub fn record_probe(&self, seq: i16, sent: Instant) {
        let mut inner = self.lock();
        inner.probes_sent += 1;
        inner
            .pending
            .retain(|_, at| sent.saturating_duration_since(*at) < PENDING_TTL);
        inner.pending.insert(seq, sent);
    }

    /// Records an ack captured at `now`, returning the round-trip time when the
    /// matching probe is pending.
    pub fn record_ack_at(&self, ack: &AckTelemetry, now: Instant) -> Option<Duration> {
        let mut inner = self.lock();
        inner.acks_received += 1;
        let proc = ack.processing_time;
        inner.proc_min = Some(inner.proc_min.map_or(proc, |m| m.min(proc)));
        inner.proc_max = Some(inner.proc_max.map_or(proc, |m| m.max(proc)));

        let sent = inner.pending.remove(&ack.seq)?;
        let rtt = now.saturating_duration_since(sent);
        let rtt_ns = rtt.as_nanos().min(u64::MAX as u128) as u64;
        inner.acks_matched += 1;
        inner.rtt_min_ns = Some(inner.rtt_min_ns.map_or(rtt_ns, |m| m.min(rtt_ns)));
        inner.rtt_max_ns = Some(inner.rtt_max_ns.map_or(rtt_ns, |m| m.max(rtt_ns)));
        inner.rtt_sum_ns += rtt_ns as u128;
        Some(rtt)
    }

    /// Builds a snapshot of current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        StatsSnapshot {
            probes_sent: inner.probes_sent,
            acks_received: inner.acks_received,
            acks_matched: inner.acks_matched,
            min_rtt_ms: inner.rtt_min_ns.map(ns_to_ms),
            max_rtt_ms: inner.rtt_max_ns.map(ns_to_ms),
            avg_rtt_ms: if inner.acks_matched > 0 {
                Some(inner.rtt_sum_ns as f64 / inner.acks_matched as f64 / 1_000_000.0)
            } else {
                None
            },
            min_processing_secs: inner.proc_min,
            max_processing_secs: inner.proc_max,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Counters stay usable even if a handler panicked mid-update.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TelemetrySink for AckStats {
    fn record_ack(&self, ack: AckTelemetry) {
        match self.record_ack_at(&ack, Instant::now()) {
            Some(rtt) => log::info!(
                "Ack seq={} from {} ({}): rtt={:.3} ms, peer processing={} s",
                ack.seq,
                ack.peer,
                ack.protocol,
                rtt.as_secs_f64() * 1000.0,
                ack.processing_time
            ),
            None => log::info!(
                "Ack seq={} from {} ({}): peer processing={} s, one-way~{} s",
                ack.seq,
                ack.peer,
                ack.protocol,
                ack.processing_time,
                ack.one_way_secs()
            ),
        }
    }
}

fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}

/// Serializable ack statistics snapshot.
#[derive(Debug, serde::Serialize)]
pub struct StatsSnapshot {
    pub probes_sent: u64,
    pub acks_received: u64,
    pub acks_matched: u64,
    pub min_rtt_ms: Option<f64>,
    pub max_rtt_ms: Option<f64>,
    pub avg_rtt_ms: Option<f64>,
    pub min_processing_secs: Option<i32>,
    pub max_processing_secs: Option<i32>,
}

impl StatsSnapshot {
    /// Prints the summary in the given format.
    pub fn print(&self, format: OutputFormat) {
        match format {
            OutputFormat::Text => self.print_text(),
            OutputFormat::Json => self.print_json(),
        }
    }

    fn print_text(&self) {
        println!("\n--- Probe Statistics ---");
        println!("Probes sent: {}", self.probes_sent);
        println!(
            "Acks received: {} ({} matched)",
            self.acks_received, self.acks_matched
        );
        if let Some(v) = self.min_rtt_ms {
            println!("Min RTT: {:.3} ms", v);
        }
        if let Some(v) = self.max_rtt_ms {
            println!("Max RTT: {:.3} ms", v);
        }
        if let Some(v) = self.avg_rtt_ms {
            println!("Avg RTT: {:.3} ms", v);
        }
        if let (Some(min), Some(max)) = (self.min_processing_secs, self.max_processing_secs) {
            println!("Peer processing: {} .. {} s", min, max);
        }
    }

    fn print_json(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }
}
