//! TCP transport with routing activation
//!
//! Opens the TCP stream, performs the DoIP routing activation handshake
//! within its own deadline and hands back the split channel. The write
//! half lives behind a mutex so concurrent senders (requests and the
//! keep-alive task) never interleave frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use doip_codec::{ActivationResult, DoipFrame, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::config::ConnectionParameters;
use crate::error::SessionError;
use crate::transport::{ChannelPair, FrameSink, FrameSource, Transport};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, params: &ConnectionParameters) -> Result<ChannelPair, SessionError> {
        let addr = params.remote_addr();
        debug!(%addr, "opening TCP connection");

        let stream = timeout(params.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SessionError::Connection(format!("connect to {addr} timed out")))?
            .map_err(|e| SessionError::Connection(format!("connect to {addr} failed: {e}")))?;

        let (read_half, write_half) = stream.into_split();
        let sink = Arc::new(TcpFrameSink {
            version: params.protocol_version,
            writer: Mutex::new(Some(write_half)),
        });
        let mut source = TcpFrameSource {
            reader: read_half,
            decoder: FrameDecoder::new(),
        };

        activate_routing(params, sink.as_ref(), &mut source).await?;

        Ok(ChannelPair {
            sink,
            source: Box::new(source),
        })
    }
}

/// Send the routing activation request and await the gateway's verdict.
/// Non-activation frames arriving first are skipped.
async fn activate_routing(
    params: &ConnectionParameters,
    sink: &TcpFrameSink,
    source: &mut TcpFrameSource,
) -> Result<(), SessionError> {
    let request = DoipFrame::routing_activation(params.tester_addr, params.activation_code);
    sink.send(request).await?;

    let deadline = Instant::now() + params.activation_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SessionError::ActivationFailed(
                "no activation response within deadline".into(),
            ));
        }

        let frame = timeout(remaining, source.next_frame())
            .await
            .map_err(|_| {
                SessionError::ActivationFailed("no activation response within deadline".into())
            })??
            .ok_or_else(|| {
                SessionError::ActivationFailed("peer closed during activation".into())
            })?;

        match frame {
            DoipFrame::RoutingActivationResponse { result, .. } => match result {
                ActivationResult::Success | ActivationResult::ConfirmationRequired => {
                    debug!(?result, "routing activation accepted");
                    return Ok(());
                }
                ActivationResult::Denied(code) => {
                    return Err(SessionError::ActivationFailed(format!(
                        "gateway denied activation with code 0x{code:02X}"
                    )));
                }
            },
            other => {
                trace!(?other, "skipping frame during activation");
            }
        }
    }
}

struct TcpFrameSink {
    version: u8,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send(&self, frame: DoipFrame) -> Result<(), SessionError> {
        let bytes = frame.encode(self.version)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::NotConnected)?;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| SessionError::ConnectionLost(format!("write failed: {e}")))?;
        trace!(len = bytes.len(), "frame written");
        Ok(())
    }

    async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }
}

struct TcpFrameSource {
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
}

#[async_trait]
impl FrameSource for TcpFrameSource {
    async fn next_frame(&mut self) -> Result<Option<DoipFrame>, SessionError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self
                .reader
                .read(&mut chunk)
                .await
                .map_err(|e| SessionError::ConnectionLost(format!("read failed: {e}")))?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.extend(&chunk[..n]);
        }
    }
}
