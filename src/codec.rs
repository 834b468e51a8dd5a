use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    jsonrpc::JSONRPCMessage,
};

/// Newline-delimited JSON-RPC framing for the local stdio endpoint.
///
/// A frame is one line terminated by `\n`; a trailing `\r` is tolerated and
/// blank lines between frames are drained as keep-alive noise. The codec
/// remembers how far it has scanned, so a frame that trickles in over many
/// reads is not rescanned from the start on every poll.
pub(crate) struct JsonRpcCodec {
    scanned: usize,
}

impl JsonRpcCodec {
    pub fn new() -> Self {
        Self { scanned: 0 }
    }
}

impl Default for JsonRpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonRpcCodec {
    type Error = Error;
    type Item = JSONRPCMessage;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                // Partial frame; resume the scan here once more bytes land.
                self.scanned = src.len();
                return Ok(None);
            };
            let end = self.scanned + offset;
            self.scanned = 0;

            let line = src.split_to(end + 1);
            let mut frame = &line[..end];
            if frame.last() == Some(&b'\r') {
                frame = &frame[..frame.len() - 1];
            }
            if frame.is_empty() {
                continue;
            }
            return decode_frame(frame).map(Some);
        }
    }
}

fn decode_frame(frame: &[u8]) -> Result<JSONRPCMessage> {
    serde_json::from_slice(frame).map_err(|e| Error::InvalidMessageFormat {
        message: format!("{e} in frame {:?}", String::from_utf8_lossy(frame)),
    })
}

impl Encoder<JSONRPCMessage> for JsonRpcCodec {
    type Error = Error;

    fn encode(&mut self, item: JSONRPCMessage, dst: &mut BytesMut) -> Result<()> {
        serde_json::to_writer((&mut *dst).writer(), &item)?;
        dst.put_u8(b'\n');
        Ok(())
    }
}
