//! Typed wrappers over the five messaging sockets.
//!
//! Every channel shares one lifecycle (open → active → closed) and one
//! framing; they differ in direction and delivery semantics:
//!
//! - **shell**: request/reply, one reply per request, FIFO per client
//! - **control**: request/reply, higher priority (interrupt/shutdown/debug)
//! - **iopub**: broadcast from the kernel, arbitrary interleaving
//! - **stdin**: kernel-initiated input requests, client replies
//! - **heartbeat**: opaque byte echo for liveness

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::connection::ConnectionInfo;
use crate::session::wire::{read_multipart, write_multipart};
use crate::types::{ClientConfig, Error, Result};

/// A logical message stream with a fixed role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Iopub,
    Stdin,
    Control,
    Heartbeat,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Shell,
        Channel::Iopub,
        Channel::Stdin,
        Channel::Control,
        Channel::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::Iopub => "iopub",
            Channel::Stdin => "stdin",
            Channel::Control => "control",
            Channel::Heartbeat => "heartbeat",
        }
    }

    /// Channels with request/reply semantics.
    pub fn is_request_reply(&self) -> bool {
        matches!(self, Channel::Shell | Channel::Control)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

async fn connect_stream(
    info: &ConnectionInfo,
    channel: Channel,
    config: &ClientConfig,
) -> Result<(BoxedReader, BoxedWriter)> {
    match info.transport.as_str() {
        "ipc" => {
            #[cfg(unix)]
            {
                let path = info.ipc_path(channel);
                let stream = tokio::time::timeout(
                    config.connect_timeout,
                    tokio::net::UnixStream::connect(&path),
                )
                .await
                .map_err(|_| Error::timeout(channel, None, "connect timed out"))??;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
            #[cfg(not(unix))]
            {
                Err(Error::validation(
                    "ipc transport is only available on unix platforms",
                ))
            }
        }
        _ => {
            let addr = (info.ip.as_str(), info.port(channel));
            let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::timeout(channel, None, "connect timed out"))??;
            stream.set_nodelay(true)?;
            let (r, w) = stream.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
    }
}

/// A connected messaging socket for one channel.
///
/// Send is available on every channel; receive on all but heartbeat, which
/// has its own echo-typed wrapper ([`HeartbeatSocket`]).
pub struct ChannelSocket {
    channel: Channel,
    reader: BoxedReader,
    writer: BoxedWriter,
    max_parts: u32,
    max_part_bytes: u32,
    open: bool,
}

impl fmt::Debug for ChannelSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSocket")
            .field("channel", &self.channel)
            .field("open", &self.open)
            .finish()
    }
}

impl ChannelSocket {
    /// Connect to a channel endpoint described by `info`.
    pub async fn connect(
        info: &ConnectionInfo,
        channel: Channel,
        config: &ClientConfig,
    ) -> Result<Self> {
        if channel == Channel::Heartbeat {
            return Err(Error::validation(
                "heartbeat uses HeartbeatSocket, not ChannelSocket",
            ));
        }
        let (reader, writer) = connect_stream(info, channel, config).await?;
        tracing::debug!(channel = %channel, endpoint = %info.endpoint(channel), "channel connected");
        Ok(Self::from_stream(channel, reader, writer, config))
    }

    /// Wrap an already-connected duplex stream. Used by in-process tests
    /// and alternative transports.
    pub fn from_stream(
        channel: Channel,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        config: &ClientConfig,
    ) -> Self {
        Self {
            channel,
            reader: Box::new(reader),
            writer: Box::new(writer),
            max_parts: config.max_frame_parts,
            max_part_bytes: config.max_part_bytes,
            open: true,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Send one multipart frame.
    pub async fn send(&mut self, parts: &[Vec<u8>]) -> Result<()> {
        if !self.open {
            return Err(Error::channel_closed(self.channel, "send on closed socket"));
        }
        write_multipart(&mut self.writer, parts).await.map_err(|e| {
            self.open = false;
            Error::channel_closed(self.channel, format!("send failed: {}", e))
        })
    }

    /// Receive one multipart frame. `None` means the peer closed cleanly.
    pub async fn recv(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        if !self.open {
            return Err(Error::channel_closed(self.channel, "recv on closed socket"));
        }
        match read_multipart(&mut self.reader, self.max_parts, self.max_part_bytes).await {
            Ok(Some(parts)) => Ok(Some(parts)),
            Ok(None) => {
                self.open = false;
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => Err(Error::malformed_frame(
                self.channel,
                format!("framing error: {}", e),
            )),
            Err(e) => {
                self.open = false;
                Err(Error::channel_closed(
                    self.channel,
                    format!("recv failed: {}", e),
                ))
            }
        }
    }

    /// Close the socket. Further sends and receives fail `ChannelClosed`.
    pub async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.writer.shutdown().await.ok();
        }
        Ok(())
    }

    /// Split into independently-owned send and receive halves so one task
    /// can read while another writes.
    pub fn into_split(self) -> (ChannelSender, ChannelReceiver) {
        (
            ChannelSender {
                channel: self.channel,
                writer: self.writer,
                open: self.open,
            },
            ChannelReceiver {
                channel: self.channel,
                reader: self.reader,
                max_parts: self.max_parts,
                max_part_bytes: self.max_part_bytes,
                open: self.open,
            },
        )
    }
}

/// Write half of a split [`ChannelSocket`].
pub struct ChannelSender {
    channel: Channel,
    writer: BoxedWriter,
    open: bool,
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("channel", &self.channel)
            .field("open", &self.open)
            .finish()
    }
}

impl ChannelSender {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub async fn send(&mut self, parts: &[Vec<u8>]) -> Result<()> {
        if !self.open {
            return Err(Error::channel_closed(self.channel, "send on closed socket"));
        }
        write_multipart(&mut self.writer, parts).await.map_err(|e| {
            self.open = false;
            Error::channel_closed(self.channel, format!("send failed: {}", e))
        })
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.writer.shutdown().await.ok();
        }
        Ok(())
    }
}

/// Read half of a split [`ChannelSocket`].
pub struct ChannelReceiver {
    channel: Channel,
    reader: BoxedReader,
    max_parts: u32,
    max_part_bytes: u32,
    open: bool,
}

impl fmt::Debug for ChannelReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReceiver")
            .field("channel", &self.channel)
            .field("open", &self.open)
            .finish()
    }
}

impl ChannelReceiver {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub async fn recv(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        if !self.open {
            return Err(Error::channel_closed(self.channel, "recv on closed socket"));
        }
        match read_multipart(&mut self.reader, self.max_parts, self.max_part_bytes).await {
            Ok(Some(parts)) => Ok(Some(parts)),
            Ok(None) => {
                self.open = false;
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => Err(Error::malformed_frame(
                self.channel,
                format!("framing error: {}", e),
            )),
            Err(e) => {
                self.open = false;
                Err(Error::channel_closed(
                    self.channel,
                    format!("recv failed: {}", e),
                ))
            }
        }
    }
}

/// Heartbeat socket: echoes arbitrary bytes to detect kernel liveness
/// independently of the messaging channels.
pub struct HeartbeatSocket {
    inner: ChannelSocket,
}

impl fmt::Debug for HeartbeatSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatSocket")
            .field("open", &self.inner.open)
            .finish()
    }
}

impl HeartbeatSocket {
    pub async fn connect(info: &ConnectionInfo, config: &ClientConfig) -> Result<Self> {
        let (reader, writer) = connect_stream(info, Channel::Heartbeat, config).await?;
        Ok(Self {
            inner: ChannelSocket::from_stream(Channel::Heartbeat, reader, writer, config),
        })
    }

    pub fn from_stream(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        config: &ClientConfig,
    ) -> Self {
        Self {
            inner: ChannelSocket::from_stream(Channel::Heartbeat, reader, writer, config),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Send `payload` and wait for the echo within `timeout`.
    pub async fn ping(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.inner.send(&[payload.to_vec()]).await?;
        let echoed = tokio::time::timeout(timeout, self.inner.recv())
            .await
            .map_err(|_| Error::timeout(Channel::Heartbeat, None, "no echo"))??;
        match echoed {
            Some(mut parts) if parts.len() == 1 => Ok(parts.remove(0)),
            Some(parts) => Err(Error::malformed_frame(
                Channel::Heartbeat,
                format!("expected single-part echo, got {} parts", parts.len()),
            )),
            None => Err(Error::channel_closed(
                Channel::Heartbeat,
                "peer closed during ping",
            )),
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}
