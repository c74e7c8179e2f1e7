//! Transport ownership. The write path is serialized behind a mutex so
//! concurrent senders interleave at frame granularity; the read path is a
//! single framed stream handed to the dispatcher. Neither path blocks the
//! other, and a failed connection never reconnects itself — that policy
//! belongs to the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use warren_proto::{CodecError, Message, MessageCodec};

use crate::error::ClientError;

/// Byte transport the client runs over: TCP in production, an in-memory
/// duplex stream in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub(crate) type MessageReader = FramedRead<ReadHalf<Box<dyn Transport>>, MessageCodec>;
type MessageWriter = FramedWrite<WriteHalf<Box<dyn Transport>>, MessageCodec>;

pub struct Connection {
    writer: Mutex<MessageWriter>,
    open: AtomicBool,
}

impl Connection {
    /// Connect to a node over TCP.
    pub async fn open(addr: &str) -> Result<(Arc<Self>, MessageReader), ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_transport(Box::new(stream)))
    }

    /// Wrap an already-established transport.
    pub fn from_transport(transport: Box<dyn Transport>) -> (Arc<Self>, MessageReader) {
        let (read_half, write_half) = tokio::io::split(transport);
        let reader = FramedRead::new(read_half, MessageCodec::new());
        let writer = FramedWrite::new(write_half, MessageCodec::new());
        (
            Arc::new(Self {
                writer: Mutex::new(writer),
                open: AtomicBool::new(true),
            }),
            reader,
        )
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Mark the connection closed. Idempotent; subsequent sends fail
    /// fast.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Send one frame. An I/O failure mid-send closes the connection.
    pub async fn send(&self, message: Message) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        if !self.is_open() {
            return Err(ClientError::NotConnected);
        }
        match writer.send(message).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.close();
                Err(match err {
                    CodecError::Io(io) => ClientError::Io(io),
                    other => ClientError::Codec(other),
                })
            }
        }
    }
}
