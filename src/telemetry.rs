//! Telemetry payload carried inside probe and ack packets.
//!
//! Both peers must agree on this layout bit for bit, so the field offsets below
//! are the only place where the wire format is defined.
//!
//! Wire format (big-endian, 24 octets):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Kind      |   Reserved    |           Type Tag            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       Sequence Number         |        Dest Send Count        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Dest Recv Count        |                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+        Processing Time        +
//! |                               |           Reserved            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Send Timestamp                         |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use thiserror::Error;

/// Encoded size of [`TelemetryPayload`].
pub const TELEMETRY_LEN: usize = 24;

/// Type tag identifying a latency probe (and its ack).
pub const PROBE_TAG: i16 = 10086;

/// Errors that can occur when decoding a telemetry payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// Application payload is shorter than the fixed telemetry layout.
    #[error("Payload of {0} bytes is too short for telemetry (need {TELEMETRY_LEN})")]
    Truncated(usize),
}

/// Classification of the type tag, validated once when the payload is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    /// The recognized probe tag.
    Probe,
    /// Any other tag; such packets are passed through untouched.
    Unrecognized(i16),
}

impl PayloadType {
    /// Classifies a raw wire tag.
    pub fn from_tag(tag: i16) -> Self {
        match tag {
            PROBE_TAG => PayloadType::Probe,
            other => PayloadType::Unrecognized(other),
        }
    }

    /// Returns the raw wire tag.
    pub fn tag(self) -> i16 {
        match self {
            PayloadType::Probe => PROBE_TAG,
            PayloadType::Unrecognized(tag) => tag,
        }
    }
}

/// Timestamped telemetry embedded in a probe or ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryPayload {
    /// Payload kind.
    pub kind: i8,
    /// Reserved octet after `kind`.
    pub pad0: u8,
    /// Type tag.
    pub payload_type: PayloadType,
    /// Probe sequence number.
    pub seq: i16,
    /// Packets sent by the destination.
    pub dest_send_count: i16,
    /// Packets received by the destination.
    pub dest_recv_count: i16,
    /// Processing delay measured by the peer, in seconds.
    pub processing_time: i32,
    /// Reserved octets after `processing_time`.
    pub pad1: [u8; 2],
    /// Unix time (seconds) at which the packet was sent.
    pub send_timestamp: i64,
}

impl Default for TelemetryPayload {
    fn default() -> Self {
        TelemetryPayload {
            kind: 0,
            pad0: 0,
            payload_type: PayloadType::Unrecognized(0),
            seq: 0,
            dest_send_count: 0,
            dest_recv_count: 0,
            processing_time: 0,
            pad1: [0; 2],
            send_timestamp: 0,
        }
    }
}

impl TelemetryPayload {
    /// Creates a probe payload.
    pub fn probe(kind: i8, seq: i16, send_timestamp: i64) -> Self {
        TelemetryPayload {
            kind,
            payload_type: PayloadType::Probe,
            seq,
            send_timestamp,
            ..Default::default()
        }
    }

    /// Returns true if the payload carries the probe tag.
    pub fn is_probe(&self) -> bool {
        self.payload_type == PayloadType::Probe
    }

    /// Serializes the payload to its 24-byte wire form.
    pub fn to_bytes(&self) -> [u8; TELEMETRY_LEN] {
        let mut buf = [0u8; TELEMETRY_LEN];
        buf[0] = self.kind as u8;
        buf[1] = self.pad0;
        buf[2..4].copy_from_slice(&self.payload_type.tag().to_be_bytes());
        buf[4..6].copy_from_slice(&self.seq.to_be_bytes());
        buf[6..8].copy_from_slice(&self.dest_send_count.to_be_bytes());
        buf[8..10].copy_from_slice(&self.dest_recv_count.to_be_bytes());
        buf[10..14].copy_from_slice(&self.processing_time.to_be_bytes());
        buf[14..16].copy_from_slice(&self.pad1);
        buf[16..24].copy_from_slice(&self.send_timestamp.to_be_bytes());
        buf
    }

    /// Deserializes a payload from the start of `buf`.
    ///
    /// Trailing bytes beyond the fixed layout are ignored.
    ///
    /// # Errors
    /// Returns [`PayloadError::Truncated`] if `buf` is shorter than 24 bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, PayloadError> {
        let Some(buf) = buf.get(..TELEMETRY_LEN) else {
            return Err(PayloadError::Truncated(buf.len()));
        };
        Ok(Self {
            kind: buf[0] as i8,
            pad0: buf[1],
            payload_type: PayloadType::from_tag(i16::from_be_bytes([buf[2], buf[3]])),
            seq: i16::from_be_bytes([buf[4], buf[5]]),
            dest_send_count: i16::from_be_bytes([buf[6], buf[7]]),
            dest_recv_count: i16::from_be_bytes([buf[8], buf[9]]),
            processing_time: i32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
            pad1: [buf[14], buf[15]],
            send_timestamp: i64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }
}

/// Decoded payload plus the local time it was captured.
///
/// Lives only for the handling of a single packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedContext {
    /// Payload decoded from the captured packet.
    pub payload: TelemetryPayload,
    /// Unix time (seconds) at which the packet was captured.
    pub received_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TelemetryPayload {
        TelemetryPayload {
            kind: 1,
            pad0: 0,
            payload_type: PayloadType::Probe,
            seq: 6920,
            dest_send_count: 1,
            dest_recv_count: 2,
            processing_time: 3,
            pad1: [0; 2],
            send_timestamp: 1_646_219_593_348,
        }
    }

    #[test]
    fn test_payload_size_is_fixed() {
        assert_eq!(sample().to_bytes().len(), TELEMETRY_LEN);
        assert_eq!(TelemetryPayload::default().to_bytes().len(), TELEMETRY_LEN);
    }

    #[test]
    fn test_field_offsets() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[2..4], &10086i16.to_be_bytes());
        assert_eq!(&bytes[4..6], &6920i16.to_be_bytes());
        assert_eq!(&bytes[6..8], &[0, 1]);
        assert_eq!(&bytes[8..10], &[0, 2]);
        assert_eq!(&bytes[10..14], &[0, 0, 0, 3]);
        assert_eq!(&bytes[16..24], &1_646_219_593_348i64.to_be_bytes());
    }

    #[test]
    fn test_roundtrip() {
        let payload = sample();
        let restored = TelemetryPayload::from_bytes(&payload.to_bytes()).unwrap();
        assert_eq!(payload, restored);
    }

    #[test]
    fn test_roundtrip_boundary_values() {
        for (i8v, i16v, i32v, i64v, pad) in [
            (i8::MIN, i16::MIN, i32::MIN, i64::MIN, 0x00u8),
            (i8::MAX, i16::MAX, i32::MAX, i64::MAX, 0xFF),
            (-1, -1, -1, -1, 0xA5),
            (0, 0, 0, 0, 0x5A),
        ] {
            let payload = TelemetryPayload {
                kind: i8v,
                pad0: pad,
                payload_type: PayloadType::from_tag(i16v),
                seq: i16v,
                dest_send_count: i16v,
                dest_recv_count: i16v,
                processing_time: i32v,
                pad1: [pad, !pad],
                send_timestamp: i64v,
            };
            let bytes = payload.to_bytes();
            let restored = TelemetryPayload::from_bytes(&bytes).unwrap();
            assert_eq!(payload, restored, "roundtrip failed for {:?}", payload);
            assert_eq!(bytes, restored.to_bytes());
        }
    }

    #[test]
    fn test_reserved_padding_is_preserved() {
        let mut bytes = sample().to_bytes();
        bytes[1] = 0x42;
        bytes[14] = 0x13;
        bytes[15] = 0x37;

        let restored = TelemetryPayload::from_bytes(&bytes).unwrap();
        assert_eq!(restored.pad0, 0x42);
        assert_eq!(restored.pad1, [0x13, 0x37]);
        assert_eq!(restored.to_bytes(), bytes);
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = sample().to_bytes();
        assert_eq!(
            TelemetryPayload::from_bytes(&bytes[..23]),
            Err(PayloadError::Truncated(23))
        );
        assert_eq!(
            TelemetryPayload::from_bytes(&[]),
            Err(PayloadError::Truncated(0))
        );
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut buf = sample().to_bytes().to_vec();
        buf.extend_from_slice(&[0xEE; 8]);
        assert_eq!(TelemetryPayload::from_bytes(&buf).unwrap(), sample());
    }

    #[test]
    fn test_payload_type_classification() {
        assert_eq!(PayloadType::from_tag(PROBE_TAG), PayloadType::Probe);
        assert_eq!(PayloadType::from_tag(7), PayloadType::Unrecognized(7));
        assert_eq!(PayloadType::Unrecognized(-3).tag(), -3);
        assert!(TelemetryPayload::probe(1, 0, 0).is_probe());
        assert!(!TelemetryPayload::default().is_probe());
    }
}
