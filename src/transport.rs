use std::{
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::{
    codec::JsonRpcCodec,
    error::{Error, Result},
    jsonrpc::JSONRPCMessage,
};

/// Transport trait for the different connection families.
#[async_trait]
pub trait Transport: Send {
    /// Establish the connection.
    async fn connect(&mut self) -> Result<()>;

    /// Consume the transport, yielding a framed message stream.
    fn framed(self: Box<Self>) -> Result<Box<dyn TransportStream>>;
}

/// A bidirectional stream of JSON-RPC messages.
pub trait TransportStream:
    Stream<Item = Result<JSONRPCMessage>> + Sink<JSONRPCMessage, Error = Error> + Send + Unpin
{
}

impl<T> TransportStream for Framed<T, JsonRpcCodec> where T: AsyncRead + AsyncWrite + Send + Unpin {}

impl std::fmt::Debug for dyn TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn TransportStream")
    }
}

/// Glue a separate reader and writer into one duplex stream so it can be
/// framed by a codec.
pub struct GenericDuplex<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> GenericDuplex<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R, W> AsyncRead for GenericDuplex<R, W>
where
    R: AsyncRead + Unpin,
    W: Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R, W> AsyncWrite for GenericDuplex<R, W>
where
    R: Unpin,
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Transport over any duplex byte stream (tests use in-memory pipes).
pub struct StreamTransport<S> {
    stream: Option<S>,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn framed(mut self: Box<Self>) -> Result<Box<dyn TransportStream>> {
        let stream = self.stream.take().ok_or(Error::TransportDisconnected)?;
        Ok(Box::new(Framed::new(stream, JsonRpcCodec::new())))
    }
}

/// The local endpoint: newline-delimited JSON-RPC over stdin/stdout.
/// Operational output goes to stderr so stdout stays a clean channel.
pub struct StdioTransport;

impl StdioTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&mut self) -> Result<()> {
        debug!("stdio transport ready");
        Ok(())
    }

    fn framed(self: Box<Self>) -> Result<Box<dyn TransportStream>> {
        let duplex = GenericDuplex::new(tokio::io::stdin(), tokio::io::stdout());
        Ok(Box::new(Framed::new(duplex, JsonRpcCodec::new())))
    }
}
