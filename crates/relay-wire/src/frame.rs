use thiserror::Error;

use crate::Record;

/// Length-prefix size in bytes (little-endian u32).
pub const HDR_SIZE: usize = 4;
/// Hard cap on the encoded record inside one frame.
pub const MAX_FRAME: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum FrameError {
    /// Not enough bytes for a prefix or a complete payload. Not terminal;
    /// the caller accumulates and retries.
    #[error("incomplete frame, need more bytes")]
    NeedMore,
    #[error("frame length {0} exceeds {MAX_FRAME}")]
    Oversize(usize),
    /// The prefix was intact but the payload is not a decodable record.
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One successfully decoded frame.
#[derive(Debug)]
pub enum Decoded {
    /// Zero-length frame; carries no record.
    Heartbeat,
    Record {
        record: Record,
        /// Total bytes consumed from the input, prefix included.
        consumed: usize,
    },
}

/// Encode `record` into a length-prefixed frame.
pub fn encode(record: &Record) -> Result<Vec<u8>, FrameError> {
    let mut buf = vec![0u8; HDR_SIZE];
    serde_json::to_writer(&mut buf, record)?;
    let len = buf.len() - HDR_SIZE;
    if len > MAX_FRAME {
        return Err(FrameError::Oversize(len));
    }
    buf[..HDR_SIZE].copy_from_slice(&(len as u32).to_le_bytes());
    Ok(buf)
}

/// The cached empty frame used as a heartbeat.
#[inline]
pub fn encode_heartbeat() -> [u8; HDR_SIZE] {
    [0; HDR_SIZE]
}

/// Decode one frame from the front of `buf`.
///
/// A heartbeat consumes exactly `HDR_SIZE` bytes. `NeedMore` means the
/// buffer holds a partial prefix or a truncated payload; everything else is
/// a protocol error for the caller's policy to handle.
pub fn decode(buf: &[u8]) -> Result<Decoded, FrameError> {
    if buf.len() < HDR_SIZE {
        return Err(FrameError::NeedMore);
    }
    let len = u32::from_le_bytes(buf[..HDR_SIZE].try_into().expect("prefix is 4 bytes")) as usize;
    if len == 0 {
        return Ok(Decoded::Heartbeat);
    }
    if len > MAX_FRAME {
        return Err(FrameError::Oversize(len));
    }
    if buf.len() < HDR_SIZE + len {
        return Err(FrameError::NeedMore);
    }
    let record = serde_json::from_slice(&buf[HDR_SIZE..HDR_SIZE + len])?;
    Ok(Decoded::Record { record, consumed: HDR_SIZE + len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LogonBody, MsgKind};

    fn sample() -> Record {
        Record {
            msg_type: MsgKind::Logon,
            msg_key: 1,
            orig_client_type: 1,
            orig_client_id: 100,
            payload: LogonBody { client_type: 1, client_id: 100 }.to_payload(),
            ..Record::default()
        }
    }

    #[test]
    fn encode_then_decode_roundtrips() {
        let rec = sample();
        let frame = encode(&rec).unwrap();
        match decode(&frame).unwrap() {
            Decoded::Record { record, consumed } => {
                assert_eq!(record, rec);
                assert_eq!(consumed, frame.len());
            }
            Decoded::Heartbeat => panic!("expected a record"),
        }
    }

    #[test]
    fn heartbeat_is_four_zero_bytes() {
        let hb = encode_heartbeat();
        assert_eq!(hb, [0, 0, 0, 0]);
        assert!(matches!(decode(&hb).unwrap(), Decoded::Heartbeat));
    }

    #[test]
    fn partial_prefix_and_truncated_payload_need_more() {
        let frame = encode(&sample()).unwrap();
        assert!(matches!(decode(&frame[..2]), Err(FrameError::NeedMore)));
        assert!(matches!(decode(&frame[..frame.len() - 1]), Err(FrameError::NeedMore)));
    }

    #[test]
    fn oversize_prefix_is_rejected() {
        let mut buf = ((MAX_FRAME + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(decode(&buf), Err(FrameError::Oversize(_))));
    }

    #[test]
    fn oversize_payload_fails_to_encode() {
        let rec = Record { payload: vec![b'x'; MAX_FRAME + 1], ..Record::default() };
        assert!(matches!(encode(&rec), Err(FrameError::Oversize(_))));
    }

    #[test]
    fn garbage_under_an_intact_prefix_is_malformed() {
        let mut buf = 5u32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"!!!!!");
        assert!(matches!(decode(&buf), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn trailing_bytes_are_left_for_the_next_frame() {
        let mut buf = encode(&sample()).unwrap();
        let first_len = buf.len();
        buf.extend_from_slice(&encode_heartbeat());
        match decode(&buf).unwrap() {
            Decoded::Record { consumed, .. } => assert_eq!(consumed, first_len),
            Decoded::Heartbeat => panic!("expected a record"),
        }
    }
}
