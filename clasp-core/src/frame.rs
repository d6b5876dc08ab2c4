//! Framing: vendor binary frames with magic, length, service/command ids and a CRC trailer.

use crc::{Crc, CRC_16_XMODEM, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};

pub const LEGACY_MAGIC: u8 = 0x5A;
pub const NEW_SYNC_MAGIC: [u8; 2] = [0xA5, 0x5A];

/// Length fields count service + command + payload.
const ID_SIZE: usize = 2;
const LEGACY_HEADER: usize = 1 + 2;
const NEW_SYNC_HEADER: usize = 2 + 4;

const LEGACY_MAX_PAYLOAD: usize = 1000;
const NEW_SYNC_MAX_PAYLOAD: usize = 16 * 1024;

const LEGACY_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const NEW_SYNC_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Wire-format family a device speaks. Chosen once per device by its
/// capability profile and threaded through as a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVariant {
    /// 0x5A magic, u16 BE length, CRC-16/XMODEM trailer (big-endian).
    Legacy,
    /// 0xA5 0x5A magic, u32 LE length, CRC-32 trailer (little-endian).
    NewSync,
}

impl ProtocolVariant {
    pub fn max_payload(self) -> usize {
        match self {
            ProtocolVariant::Legacy => LEGACY_MAX_PAYLOAD,
            ProtocolVariant::NewSync => NEW_SYNC_MAX_PAYLOAD,
        }
    }
}

/// One decoded protocol message unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub service_id: u8,
    pub command_id: u8,
    pub payload: Vec<u8>,
}

/// Error encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds the variant maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("need more bytes")]
    NeedMore,
    #[error("corrupt frame: {0}")]
    Corrupt(&'static str),
}

/// Encode a frame. Deterministic for identical inputs; payload size is
/// checked against the variant maximum before any bytes are produced.
pub fn encode(
    variant: ProtocolVariant,
    service_id: u8,
    command_id: u8,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let max = variant.max_payload();
    if payload.len() > max {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max,
        });
    }
    let body_len = payload.len() + ID_SIZE;
    match variant {
        ProtocolVariant::Legacy => {
            let mut out = Vec::with_capacity(LEGACY_HEADER + body_len + 2);
            out.push(LEGACY_MAGIC);
            out.extend_from_slice(&(body_len as u16).to_be_bytes());
            out.push(service_id);
            out.push(command_id);
            out.extend_from_slice(payload);
            let crc = LEGACY_CRC.checksum(&out);
            out.extend_from_slice(&crc.to_be_bytes());
            Ok(out)
        }
        ProtocolVariant::NewSync => {
            let mut out = Vec::with_capacity(NEW_SYNC_HEADER + body_len + 4);
            out.extend_from_slice(&NEW_SYNC_MAGIC);
            out.extend_from_slice(&(body_len as u32).to_le_bytes());
            out.push(service_id);
            out.push(command_id);
            out.extend_from_slice(payload);
            let crc = NEW_SYNC_CRC.checksum(&out);
            out.extend_from_slice(&crc.to_le_bytes());
            Ok(out)
        }
    }
}

/// Decode one frame from the front of `bytes`. Returns the frame and the
/// number of bytes consumed so back-to-back frames parse in sequence.
/// A short buffer reports `NeedMore` without consuming anything; the CRC is
/// verified before any payload is exposed.
pub fn decode(variant: ProtocolVariant, bytes: &[u8]) -> Result<(Frame, usize), FrameError> {
    match variant {
        ProtocolVariant::Legacy => {
            if bytes.is_empty() {
                return Err(FrameError::NeedMore);
            }
            if bytes[0] != LEGACY_MAGIC {
                return Err(FrameError::Corrupt("bad magic"));
            }
            if bytes.len() < LEGACY_HEADER {
                return Err(FrameError::NeedMore);
            }
            let body_len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
            if body_len < ID_SIZE {
                return Err(FrameError::Corrupt("length shorter than the ids"));
            }
            if body_len - ID_SIZE > LEGACY_MAX_PAYLOAD {
                return Err(FrameError::Corrupt("declared length exceeds variant maximum"));
            }
            let total = LEGACY_HEADER + body_len + 2;
            if bytes.len() < total {
                return Err(FrameError::NeedMore);
            }
            let crc_at = total - 2;
            let want = u16::from_be_bytes([bytes[crc_at], bytes[crc_at + 1]]);
            if LEGACY_CRC.checksum(&bytes[..crc_at]) != want {
                return Err(FrameError::Corrupt("checksum mismatch"));
            }
            Ok((
                Frame {
                    service_id: bytes[LEGACY_HEADER],
                    command_id: bytes[LEGACY_HEADER + 1],
                    payload: bytes[LEGACY_HEADER + ID_SIZE..crc_at].to_vec(),
                },
                total,
            ))
        }
        ProtocolVariant::NewSync => {
            if bytes.len() < 2 {
                if !bytes.is_empty() && bytes[0] != NEW_SYNC_MAGIC[0] {
                    return Err(FrameError::Corrupt("bad magic"));
                }
                return Err(FrameError::NeedMore);
            }
            if bytes[..2] != NEW_SYNC_MAGIC {
                return Err(FrameError::Corrupt("bad magic"));
            }
            if bytes.len() < NEW_SYNC_HEADER {
                return Err(FrameError::NeedMore);
            }
            let body_len = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
            if body_len < ID_SIZE {
                return Err(FrameError::Corrupt("length shorter than the ids"));
            }
            if body_len - ID_SIZE > NEW_SYNC_MAX_PAYLOAD {
                return Err(FrameError::Corrupt("declared length exceeds variant maximum"));
            }
            let total = NEW_SYNC_HEADER + body_len + 4;
            if bytes.len() < total {
                return Err(FrameError::NeedMore);
            }
            let crc_at = total - 4;
            let want = u32::from_le_bytes([
                bytes[crc_at],
                bytes[crc_at + 1],
                bytes[crc_at + 2],
                bytes[crc_at + 3],
            ]);
            if NEW_SYNC_CRC.checksum(&bytes[..crc_at]) != want {
                return Err(FrameError::Corrupt("checksum mismatch"));
            }
            Ok((
                Frame {
                    service_id: bytes[NEW_SYNC_HEADER],
                    command_id: bytes[NEW_SYNC_HEADER + 1],
                    payload: bytes[NEW_SYNC_HEADER + ID_SIZE..crc_at].to_vec(),
                },
                total,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_legacy() {
        let frame = encode(ProtocolVariant::Legacy, 0x0A, 0x02, b"hello").unwrap();
        let (decoded, n) = decode(ProtocolVariant::Legacy, &frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded.service_id, 0x0A);
        assert_eq!(decoded.command_id, 0x02);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn roundtrip_new_sync() {
        let payload: Vec<u8> = (0..200u16).map(|i| (i % 251) as u8).collect();
        let frame = encode(ProtocolVariant::NewSync, 0x2C, 0x03, &payload).unwrap();
        let (decoded, n) = decode(ProtocolVariant::NewSync, &frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded.service_id, 0x2C);
        assert_eq!(decoded.command_id, 0x03);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn roundtrip_empty_payload() {
        for variant in [ProtocolVariant::Legacy, ProtocolVariant::NewSync] {
            let frame = encode(variant, 1, 1, &[]).unwrap();
            let (decoded, n) = decode(variant, &frame).unwrap();
            assert_eq!(n, frame.len());
            assert!(decoded.payload.is_empty());
        }
    }

    #[test]
    fn legacy_known_vector() {
        let frame = encode(ProtocolVariant::Legacy, 0x01, 0x01, &[0x01]).unwrap();
        assert_eq!(frame, [0x5A, 0x00, 0x03, 0x01, 0x01, 0x01, 0x79, 0x6A]);
    }

    #[test]
    fn new_sync_known_vector() {
        let frame = encode(ProtocolVariant::NewSync, 0x2C, 0x03, &[0xDE, 0xAD]).unwrap();
        assert_eq!(
            frame,
            [0xA5, 0x5A, 0x04, 0x00, 0x00, 0x00, 0x2C, 0x03, 0xDE, 0xAD, 0xEA, 0xF5, 0xB3, 0x90]
        );
    }

    #[test]
    fn checksum_mismatch_is_corrupt() {
        for variant in [ProtocolVariant::Legacy, ProtocolVariant::NewSync] {
            let mut frame = encode(variant, 7, 8, b"payload").unwrap();
            let mid = frame.len() / 2;
            frame[mid] ^= 0xFF;
            assert!(matches!(
                decode(variant, &frame),
                Err(FrameError::Corrupt(_))
            ));
        }
    }

    #[test]
    fn truncated_needs_more() {
        for variant in [ProtocolVariant::Legacy, ProtocolVariant::NewSync] {
            let frame = encode(variant, 7, 8, b"payload").unwrap();
            for cut in [1, 2, frame.len() - 1] {
                assert!(matches!(
                    decode(variant, &frame[..cut]),
                    Err(FrameError::NeedMore)
                ));
            }
            assert!(matches!(decode(variant, &[]), Err(FrameError::NeedMore)));
        }
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut frame = encode(ProtocolVariant::Legacy, 1, 2, b"x").unwrap();
        frame[0] = 0x00;
        assert!(matches!(
            decode(ProtocolVariant::Legacy, &frame),
            Err(FrameError::Corrupt(_))
        ));

        let mut frame = encode(ProtocolVariant::NewSync, 1, 2, b"x").unwrap();
        frame[1] = 0x00;
        assert!(matches!(
            decode(ProtocolVariant::NewSync, &frame),
            Err(FrameError::Corrupt(_))
        ));
    }

    #[test]
    fn oversized_payload_rejected_at_encode() {
        let payload = vec![0u8; ProtocolVariant::Legacy.max_payload() + 1];
        assert!(matches!(
            encode(ProtocolVariant::Legacy, 1, 1, &payload),
            Err(FrameError::PayloadTooLarge { .. })
        ));
        // Exactly at the maximum is fine.
        let payload = vec![0u8; ProtocolVariant::Legacy.max_payload()];
        assert!(encode(ProtocolVariant::Legacy, 1, 1, &payload).is_ok());
    }

    #[test]
    fn forged_length_rejected_before_buffering() {
        // A declared length past the variant maximum must fail as corrupt even
        // though the buffer holds fewer bytes than the length claims.
        let mut header = vec![LEGACY_MAGIC];
        header.extend_from_slice(&u16::MAX.to_be_bytes());
        assert!(matches!(
            decode(ProtocolVariant::Legacy, &header),
            Err(FrameError::Corrupt(_))
        ));

        let mut header = NEW_SYNC_MAGIC.to_vec();
        header.extend_from_slice(&(1u32 << 24).to_le_bytes());
        assert!(matches!(
            decode(ProtocolVariant::NewSync, &header),
            Err(FrameError::Corrupt(_))
        ));
    }

    #[test]
    fn back_to_back_frames() {
        let fa = encode(ProtocolVariant::Legacy, 1, 1, b"first").unwrap();
        let fb = encode(ProtocolVariant::Legacy, 2, 2, b"second").unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode(ProtocolVariant::Legacy, &buf).unwrap();
        assert_eq!(n1, fa.len());
        assert_eq!(m1.payload, b"first");
        let (m2, n2) = decode(ProtocolVariant::Legacy, &buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m2.payload, b"second");
    }
}
