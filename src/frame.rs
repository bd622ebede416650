//! Binary frame codec for ThermoBand telemetry.
//!
//! Bridges relay each sensor reading as a single delimited binary frame.
//! This module turns a received byte buffer into a [`TelemetryReading`] or a
//! typed rejection; it never panics on malformed input.

use thiserror::Error;

/// First byte of every valid frame.
pub const START_SENTINEL: u8 = 0xAA;

/// Last byte of every valid frame.
pub const END_SENTINEL: u8 = 0x55;

/// Fixed header (20 bytes) plus checksum and end sentinel. The name section
/// may be empty, so this is the smallest parseable frame.
pub const MIN_FRAME_LEN: usize = 22;

/// Offset where the variable-length name section begins.
const NAME_OFFSET: usize = 20;

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, need at least {MIN_FRAME_LEN}")]
    TooShort { len: usize },

    #[error("bad start sentinel: {found:#04x}")]
    BadStartSentinel { found: u8 },

    #[error("bad end sentinel: {found:#04x}")]
    BadEndSentinel { found: u8 },

    #[error("declared length {declared} does not match received {actual} bytes")]
    LengthMismatch { declared: u8, actual: usize },

    #[error("checksum mismatch: computed {computed:#04x}, frame carries {stored:#04x}")]
    ChecksumMismatch { computed: u8, stored: u8 },
}

/// One decoded sensor reading.
///
/// Temperatures are degrees Celsius; the wire carries them as tenths in a
/// little-endian u16. The timestamp is epoch milliseconds (the wire carries
/// epoch seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryReading {
    /// Leaf name from the trailing name section; `None` when the bridge
    /// sent an empty name (older firmware identifies by hardware id only).
    pub name: Option<String>,
    /// Hardware address, six bytes rendered as `:`-joined lowercase hex.
    pub hardware_id: String,
    /// Reading timestamp, epoch milliseconds.
    pub timestamp_ms: i64,
    /// Skin-side probe temperature.
    pub internal_temp: f64,
    /// Air-side probe temperature.
    pub external_temp: f64,
    /// Board ambient temperature.
    pub ambient_temp: f64,
}

/// Decode a single frame.
///
/// Validation short-circuits in order: length floor, start sentinel, end
/// sentinel, declared length, checksum. A frame failing any check is
/// rejected whole; no fields are extracted from it.
pub fn decode(buf: &[u8]) -> Result<TelemetryReading, FrameError> {
    let len = buf.len();
    if len < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len });
    }
    if buf[0] != START_SENTINEL {
        return Err(FrameError::BadStartSentinel { found: buf[0] });
    }
    if buf[len - 1] != END_SENTINEL {
        return Err(FrameError::BadEndSentinel { found: buf[len - 1] });
    }
    if buf[1] as usize != len {
        return Err(FrameError::LengthMismatch {
            declared: buf[1],
            actual: len,
        });
    }

    // XOR over everything between the start sentinel and the checksum byte:
    // the length byte through the last name byte.
    let computed = buf[1..len - 2].iter().fold(0u8, |acc, b| acc ^ b);
    let stored = buf[len - 2];
    if computed != stored {
        return Err(FrameError::ChecksumMismatch { computed, stored });
    }

    let ts_secs = u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]);
    let external_temp = u16::from_le_bytes([buf[7], buf[8]]) as f64 / 10.0;
    let internal_temp = u16::from_le_bytes([buf[9], buf[10]]) as f64 / 10.0;
    let ambient_temp = u16::from_le_bytes([buf[11], buf[12]]) as f64 / 10.0;
    // buf[2] is the frame type and buf[13] the battery level; neither is
    // surfaced in a reading.

    // Bridges format each address byte without zero padding, so 0x0a
    // renders as "a". Stored history keys on this exact form.
    let hardware_id = buf[14..20]
        .iter()
        .map(|b| format!("{:x}", b))
        .collect::<Vec<_>>()
        .join(":");

    let name_bytes = &buf[NAME_OFFSET..len - 2];
    let name = if name_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(name_bytes).into_owned())
    };

    Ok(TelemetryReading {
        name,
        hardware_id,
        timestamp_ms: i64::from(ts_secs) * 1000,
        internal_temp,
        external_temp,
        ambient_temp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_frame(
        name: &str,
        ts_secs: u32,
        external_tenths: u16,
        internal_tenths: u16,
        ambient_tenths: u16,
        hardware: [u8; 6],
    ) -> Vec<u8> {
        let len = MIN_FRAME_LEN + name.len();
        let mut buf = Vec::with_capacity(len);
        buf.push(START_SENTINEL);
        buf.push(len as u8);
        buf.push(0x01); // frame type
        buf.extend_from_slice(&ts_secs.to_le_bytes());
        buf.extend_from_slice(&external_tenths.to_le_bytes());
        buf.extend_from_slice(&internal_tenths.to_le_bytes());
        buf.extend_from_slice(&ambient_tenths.to_le_bytes());
        buf.push(0x64); // battery level
        buf.extend_from_slice(&hardware);
        buf.extend_from_slice(name.as_bytes());
        let checksum = buf[1..].iter().fold(0u8, |acc, b| acc ^ b);
        buf.push(checksum);
        buf.push(END_SENTINEL);
        buf
    }

    #[test]
    fn test_decode_named_frame() {
        let frame = build_frame("AB", 1_690_000_000, 250, 300, 200, [1, 2, 3, 4, 5, 6]);
        assert_eq!(frame.len(), 24);

        let reading = decode(&frame).unwrap();
        assert_eq!(reading.name.as_deref(), Some("AB"));
        assert_eq!(reading.hardware_id, "1:2:3:4:5:6");
        assert_eq!(reading.timestamp_ms, 1_690_000_000_000);
        assert_eq!(reading.external_temp, 25.0);
        assert_eq!(reading.internal_temp, 30.0);
        assert_eq!(reading.ambient_temp, 20.0);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let frame = build_frame("band-7", 1_700_000_000, 251, 305, 198, [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        let first = decode(&frame).unwrap();
        let second = decode(&frame).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_name_yields_none() {
        let frame = build_frame("", 1_690_000_000, 250, 300, 200, [1, 2, 3, 4, 5, 6]);
        assert_eq!(frame.len(), MIN_FRAME_LEN);

        let reading = decode(&frame).unwrap();
        assert_eq!(reading.name, None);
        assert_eq!(reading.hardware_id, "1:2:3:4:5:6");
    }

    #[test]
    fn test_hardware_id_hex_is_unpadded() {
        let frame = build_frame("x", 1, 10, 10, 10, [0x0a, 0xbc, 0x01, 0x00, 0xff, 0x10]);
        let reading = decode(&frame).unwrap();
        assert_eq!(reading.hardware_id, "a:bc:1:0:ff:10");
    }

    #[test]
    fn test_rejects_bad_start_sentinel() {
        let mut frame = build_frame("AB", 1_690_000_000, 250, 300, 200, [1, 2, 3, 4, 5, 6]);
        frame[0] = 0xAB;
        assert_eq!(
            decode(&frame),
            Err(FrameError::BadStartSentinel { found: 0xAB })
        );
    }

    #[test]
    fn test_rejects_bad_end_sentinel() {
        let mut frame = build_frame("AB", 1_690_000_000, 250, 300, 200, [1, 2, 3, 4, 5, 6]);
        let last = frame.len() - 1;
        frame[last] = 0x56;
        assert_eq!(
            decode(&frame),
            Err(FrameError::BadEndSentinel { found: 0x56 })
        );
    }

    #[test]
    fn test_rejects_wrong_declared_length() {
        let mut frame = build_frame("AB", 1_690_000_000, 250, 300, 200, [1, 2, 3, 4, 5, 6]);
        frame[1] = frame[1].wrapping_add(1);
        assert_eq!(
            decode(&frame),
            Err(FrameError::LengthMismatch {
                declared: 25,
                actual: 24
            })
        );
    }

    #[test]
    fn test_rejects_corrupted_checksum_byte() {
        let mut frame = build_frame("AB", 1_690_000_000, 250, 300, 200, [1, 2, 3, 4, 5, 6]);
        let pos = frame.len() - 2;
        frame[pos] ^= 0xFF;
        assert!(matches!(
            decode(&frame),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_corrupted_payload_byte() {
        // Any single flipped payload bit must break the checksum.
        let reference = build_frame("AB", 1_690_000_000, 250, 300, 200, [1, 2, 3, 4, 5, 6]);
        for pos in 2..reference.len() - 2 {
            let mut frame = reference.clone();
            frame[pos] ^= 0x01;
            assert!(
                matches!(decode(&frame), Err(FrameError::ChecksumMismatch { .. })),
                "flip at offset {} was not rejected",
                pos
            );
        }
    }

    #[test]
    fn test_rejects_short_buffers() {
        assert_eq!(decode(&[]), Err(FrameError::TooShort { len: 0 }));
        let short = vec![START_SENTINEL; MIN_FRAME_LEN - 1];
        assert_eq!(
            decode(&short),
            Err(FrameError::TooShort {
                len: MIN_FRAME_LEN - 1
            })
        );
    }

    #[test]
    fn test_rejects_truncated_frame() {
        let mut frame = build_frame("sensor-wing-a", 1_690_000_000, 250, 300, 200, [1, 2, 3, 4, 5, 6]);
        // Drop the final name byte but keep checksum + end sentinel intact.
        let cut = frame.len() - 3;
        frame.remove(cut);
        assert!(matches!(
            decode(&frame),
            Err(FrameError::LengthMismatch { .. })
        ));
    }
}
