use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use byteorder::{ByteOrder, LittleEndian};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::trace;

use super::{error::Error, wire::Message};

pub type ChannelId = u64;

/// Largest frame either side accepts.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A message-oriented link over one TCP connection. Every frame is a
/// little-endian `u32` length followed by that many bytes.
///
/// A channel that timed out mid-frame is out of sync with its peer and must
/// be discarded.
pub struct Channel {
    id: ChannelId,
    stream: TcpStream,
    remote_addr: SocketAddr,
    read_timeout: Option<Duration>,
}

impl Channel {
    pub async fn connect(addr: SocketAddr) -> Result<Self, Error> {
        Self::from_stream(TcpStream::connect(addr).await?)
    }

    /// Wraps an established connection, either dialed or accepted.
    pub fn from_stream(stream: TcpStream) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?;
        Ok(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            remote_addr,
            read_timeout: None,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Deadline applied to every subsequent read. `None` waits forever.
    pub fn set_read_timeout(&mut self, read_timeout: Option<Duration>) {
        self.read_timeout = read_timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub async fn write_message(&mut self, msg: &[u8]) -> Result<(), Error> {
        let len = msg.len();
        if len > MAX_MESSAGE_LEN {
            Err(Error::MessageLengthOverflowed(len))?
        }
        let mut buf = vec![0u8; 4];
        buf.reserve(len);
        LittleEndian::write_u32(&mut buf, len as u32);
        buf.extend_from_slice(msg);
        self.stream.write_all(&buf).await?;
        trace!(remote = %self.remote_addr, len, "wrote frame");
        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<Vec<u8>, Error> {
        match self.read_timeout {
            Some(limit) => timeout(limit, self.read_frame())
                .await
                .map_err(|_| Error::TimedOut(limit))?,
            None => self.read_frame().await,
        }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), Error> {
        self.write_message(&msg.encode()?).await
    }

    pub async fn receive(&mut self) -> Result<Message, Error> {
        Message::decode(&self.read_message().await?)
    }

    pub async fn close(mut self) -> Result<(), Error> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = LittleEndian::read_u32(&len_buf) as usize;
        if len > MAX_MESSAGE_LEN {
            Err(Error::MessageLengthOverflowed(len))?
        }
        let mut msg = vec![0u8; len];
        self.stream.read_exact(&mut msg).await?;
        trace!(remote = %self.remote_addr, len, "read frame");
        Ok(msg)
    }
}
