//! Framing: one length-prefixed JSON [`Message`] per frame.
//!
//! Wraps [`tokio_util::codec::LengthDelimitedCodec`] so callers work with
//! `Message` values directly rather than raw `BytesMut`. This replaces
//! `PerspectiveBroker`'s banana framing from the original with a transport
//! that's trivial to drive from a plain `TcpStream`.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::{Result, RpcError};
use crate::message::Message;

pub struct JsonCodec {
    inner: LengthDelimitedCodec,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
        }
    }
}

impl Decoder for JsonCodec {
    type Item = Message;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Message>, RpcError> {
        let Some(frame) = self
            .inner
            .decode(src)
            .map_err(|e| RpcError::Codec(e.to_string()))?
        else {
            return Ok(None);
        };
        let msg = serde_json::from_slice(&frame)?;
        Ok(Some(msg))
    }
}

impl Encoder<Message> for JsonCodec {
    type Error = RpcError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let bytes: Bytes = serde_json::to_vec(&item)?.into();
        self.inner
            .encode(bytes, dst)
            .map_err(|e| RpcError::Codec(e.to_string()))
    }
}
