//! Binary frames exchanged between peers.
//!
//! Every frame is a one-byte tag followed by its body. Multi-byte integers
//! are big-endian. The transport delivers frames whole, so a frame never
//! carries its own total length.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MeshError;

/// Length of the random challenge sent in [`Frame::Check`].
pub const NONCE_LEN: usize = 16;

const TAG_HELLO: u8 = 0x01;
const TAG_CHECK: u8 = 0x02;
const TAG_CHECK_REPLY: u8 = 0x03;
const TAG_DONE: u8 = 0x04;
const TAG_MESSAGE: u8 = 0x10;

/// First handshake step: who we are and which mesh we belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub network_id: Vec<u8>,
    pub advertisement: Option<String>,
    pub public_key: Vec<u8>,
}

/// A single frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(Hello),
    Check { nonce: [u8; NONCE_LEN] },
    CheckReply { signature: Vec<u8> },
    Done,
    /// An application message: registry kind plus the encoded body.
    Message { kind: String, body: Bytes },
}

impl Frame {
    /// Short frame name for logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Check { .. } => "check",
            Self::CheckReply { .. } => "check_reply",
            Self::Done => "done",
            Self::Message { .. } => "message",
        }
    }

    /// Encode the frame into its wire form.
    pub fn encode(&self) -> Result<Bytes, MeshError> {
        let mut buf = BytesMut::new();
        match self {
            Self::Hello(hello) => {
                buf.put_u8(TAG_HELLO);
                put_short_bytes(&mut buf, &hello.network_id, "network_id")?;
                let ad = hello.advertisement.as_deref().unwrap_or_default();
                put_short_bytes(&mut buf, ad.as_bytes(), "advertisement")?;
                put_short_bytes(&mut buf, &hello.public_key, "public_key")?;
            }
            Self::Check { nonce } => {
                buf.put_u8(TAG_CHECK);
                buf.put_slice(nonce);
            }
            Self::CheckReply { signature } => {
                buf.put_u8(TAG_CHECK_REPLY);
                let len = i32::try_from(signature.len())
                    .map_err(|_| MeshError::Protocol("signature too long".into()))?;
                buf.put_i32(len);
                buf.put_slice(signature);
            }
            Self::Done => buf.put_u8(TAG_DONE),
            Self::Message { kind, body } => {
                buf.put_u8(TAG_MESSAGE);
                put_short_bytes(&mut buf, kind.as_bytes(), "message kind")?;
                buf.put_slice(body);
            }
        }
        Ok(buf.freeze())
    }

    /// Decode a whole frame. Trailing bytes are rejected.
    pub fn decode(mut buf: Bytes) -> Result<Self, MeshError> {
        if !buf.has_remaining() {
            return Err(MeshError::Protocol("empty frame".into()));
        }
        let frame = match buf.get_u8() {
            TAG_HELLO => {
                let network_id = take_short_bytes(&mut buf, "network_id")?.to_vec();
                let ad = take_short_bytes(&mut buf, "advertisement")?;
                let advertisement = if ad.is_empty() {
                    None
                } else {
                    Some(utf8(ad, "advertisement")?)
                };
                let public_key = take_short_bytes(&mut buf, "public_key")?.to_vec();
                Self::Hello(Hello {
                    network_id,
                    advertisement,
                    public_key,
                })
            }
            TAG_CHECK => {
                let mut nonce = [0u8; NONCE_LEN];
                ensure_remaining(&buf, NONCE_LEN, "nonce")?;
                buf.copy_to_slice(&mut nonce);
                Self::Check { nonce }
            }
            TAG_CHECK_REPLY => {
                ensure_remaining(&buf, 4, "signature length")?;
                let len = buf.get_i32();
                let len = usize::try_from(len)
                    .map_err(|_| MeshError::Protocol(format!("negative signature length {len}")))?;
                ensure_remaining(&buf, len, "signature")?;
                let signature = buf.split_to(len).to_vec();
                Self::CheckReply { signature }
            }
            TAG_DONE => Self::Done,
            TAG_MESSAGE => {
                let kind = utf8(take_short_bytes(&mut buf, "message kind")?, "message kind")?;
                let body = buf.split_to(buf.remaining());
                Self::Message { kind, body }
            }
            tag => return Err(MeshError::Protocol(format!("unknown frame tag {tag:#04x}"))),
        };
        if buf.has_remaining() {
            return Err(MeshError::Protocol(format!(
                "{} trailing bytes after {} frame",
                buf.remaining(),
                frame.name()
            )));
        }
        Ok(frame)
    }
}

fn put_short_bytes(buf: &mut BytesMut, bytes: &[u8], field: &str) -> Result<(), MeshError> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| MeshError::Protocol(format!("{field} exceeds {} bytes", u16::MAX)))?;
    buf.put_u16(len);
    buf.put_slice(bytes);
    Ok(())
}

fn take_short_bytes(buf: &mut Bytes, field: &str) -> Result<Bytes, MeshError> {
    ensure_remaining(buf, 2, field)?;
    let len = buf.get_u16() as usize;
    ensure_remaining(buf, len, field)?;
    Ok(buf.split_to(len))
}

fn ensure_remaining(buf: &Bytes, needed: usize, field: &str) -> Result<(), MeshError> {
    if buf.remaining() < needed {
        return Err(MeshError::Protocol(format!(
            "truncated {field}: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn utf8(bytes: Bytes, field: &str) -> Result<String, MeshError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| MeshError::Protocol(format!("{field} is not valid UTF-8")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
