//! Signed envelope codec for bus messages.
//!
//! Every physical message on either topic is a single frame:
//!
//! ```text
//! +----------------------+------------------------+--------------------+
//! | length (4 bytes, BE) | prost-encoded message  | HMAC-SHA256 (32 B) |
//! +----------------------+------------------------+--------------------+
//! ```
//!
//! The MAC is computed over the encoded message bytes with the shared
//! signature key. Verification recomputes the MAC and compares in constant
//! time before the body is decoded; the length field is validated before
//! any allocation sized from it.

use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use prost::Message;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Length of the HMAC-SHA256 suffix.
pub const MAC_LEN: usize = 32;

/// Maximum accepted message body size (16 MiB). Frames declaring a larger
/// body are rejected before allocation.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Errors from opening a sealed frame.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The frame is shorter than a header plus MAC.
    #[error("frame truncated: {len} bytes")]
    Truncated {
        /// Observed frame length.
        len: usize,
    },

    /// The declared body length does not match the frame size.
    #[error("frame length mismatch: header declares {declared} bytes, frame carries {actual}")]
    LengthMismatch {
        /// Body length from the header.
        declared: usize,
        /// Body length implied by the frame size.
        actual: usize,
    },

    /// The declared body length exceeds [`MAX_MESSAGE_SIZE`].
    #[error("message of {declared} bytes exceeds maximum of {MAX_MESSAGE_SIZE}")]
    TooLarge {
        /// Body length from the header.
        declared: usize,
    },

    /// MAC verification failed; the message was tampered with or sealed
    /// with a different key.
    #[error("signature verification failed")]
    MacMismatch,

    /// The body did not decode as the expected message type.
    #[error("decoding message body")]
    Decode(#[from] prost::DecodeError),
}

fn compute_mac(body: &[u8], key: &[u8]) -> [u8; MAC_LEN] {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key of any length is accepted");
    mac.update(body);
    mac.finalize().into_bytes().into()
}

/// Seals a protocol message into a signed frame.
///
/// # Panics
///
/// Panics if the encoded message exceeds [`MAX_MESSAGE_SIZE`].
#[must_use]
pub fn seal<M: Message>(msg: &M, key: &[u8]) -> Vec<u8> {
    let body = msg.encode_to_vec();
    assert!(
        body.len() <= MAX_MESSAGE_SIZE,
        "encoded message of {} bytes exceeds protocol limit {MAX_MESSAGE_SIZE}",
        body.len()
    );
    let mac = compute_mac(&body, key);

    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len() + MAC_LEN);
    #[allow(clippy::cast_possible_truncation)]
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    frame.put_slice(&mac);
    frame.to_vec()
}

/// Opens a signed frame, verifying the MAC before decoding the body.
///
/// # Errors
///
/// Returns an [`EnvelopeError`] when the frame is malformed, the MAC does
/// not verify, or the body does not decode as `M`.
pub fn open<M: Message + Default>(frame: &[u8], key: &[u8]) -> Result<M, EnvelopeError> {
    if frame.len() < HEADER_LEN + MAC_LEN {
        return Err(EnvelopeError::Truncated { len: frame.len() });
    }

    let mut header = &frame[..HEADER_LEN];
    let declared = header.get_u32() as usize;
    if declared > MAX_MESSAGE_SIZE {
        return Err(EnvelopeError::TooLarge { declared });
    }

    let actual = frame.len() - HEADER_LEN - MAC_LEN;
    if declared != actual {
        return Err(EnvelopeError::LengthMismatch { declared, actual });
    }

    let body = &frame[HEADER_LEN..HEADER_LEN + declared];
    let mac = &frame[HEADER_LEN + declared..];

    let expected = compute_mac(body, key);
    if expected[..].ct_eq(mac).unwrap_u8() != 1 {
        return Err(EnvelopeError::MacMismatch);
    }

    Ok(M::decode(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeploymentRequest, DeploymentStatus};

    const KEY: &[u8] = b"test-signature-key";

    fn request() -> DeploymentRequest {
        DeploymentRequest {
            deployment: None,
            delivery_id: "d-7".to_owned(),
            cluster: "dev".to_owned(),
            timestamp: 100,
            deadline: 160,
            payload: b"{}".to_vec(),
        }
    }

    #[test]
    fn round_trip() {
        let req = request();
        let frame = seal(&req, KEY);
        let opened: DeploymentRequest = open(&frame, KEY).unwrap();
        assert_eq!(opened, req);
    }

    #[test]
    fn tampering_with_any_byte_fails() {
        let frame = seal(&request(), KEY);
        for i in 0..frame.len() {
            let mut mangled = frame.clone();
            mangled[i] ^= 0x01;
            let result = open::<DeploymentRequest>(&mangled, KEY);
            assert!(result.is_err(), "byte {i} flipped but frame still opened");
        }
    }

    #[test]
    fn wrong_key_fails() {
        let frame = seal(&request(), KEY);
        let result = open::<DeploymentRequest>(&frame, b"other-key");
        assert!(matches!(result, Err(EnvelopeError::MacMismatch)));
    }

    #[test]
    fn truncated_frame() {
        let frame = seal(&request(), KEY);
        let result = open::<DeploymentRequest>(&frame[..10], KEY);
        assert!(matches!(result, Err(EnvelopeError::Truncated { .. })));
    }

    #[test]
    fn length_mismatch() {
        let mut frame = seal(&request(), KEY);
        frame.extend_from_slice(b"trailing");
        let result = open::<DeploymentRequest>(&frame, KEY);
        assert!(matches!(result, Err(EnvelopeError::LengthMismatch { .. })));
    }

    #[test]
    fn oversized_declaration_rejected_before_allocation() {
        let mut frame = vec![0xff, 0xff, 0xff, 0xff];
        frame.extend_from_slice(&[0u8; MAC_LEN]);
        let result = open::<DeploymentRequest>(&frame, KEY);
        assert!(matches!(result, Err(EnvelopeError::TooLarge { .. })));
    }

    #[test]
    fn wrong_message_type_is_a_decode_error() {
        // A status frame opened as a request: same key, valid MAC, but the
        // body does not decode as the expected type for every shape. Field
        // tags overlap across our messages, so decoding may also succeed
        // with garbage fields; the guarantee under test is only that open()
        // never panics on a validly sealed foreign body.
        let status = DeploymentStatus {
            deployment: None,
            delivery_id: "d-7".to_owned(),
            state: 3,
            description: "x".to_owned(),
        };
        let frame = seal(&status, KEY);
        let _ = open::<DeploymentRequest>(&frame, KEY);
    }
}
