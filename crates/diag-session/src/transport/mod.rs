//! Transport seam between the session core and the wire
//!
//! A [`Transport`] opens one channel per session. The channel is split
//! into a shared [`FrameSink`] (any task may send, writes are
//! serialized internally) and an exclusive [`FrameSource`] owned by the
//! session's read path. [`TcpTransport`] is the production
//! implementation; tests substitute a scripted mock.

use std::sync::Arc;

use async_trait::async_trait;
use doip_codec::DoipFrame;

use crate::config::ConnectionParameters;
use crate::error::SessionError;

mod mock;
mod tcp;

pub use mock::{MockBehaviour, MockTransport};
pub use tcp::TcpTransport;

/// Outbound half of a channel. Cloneable via `Arc`; concurrent senders
/// are serialized so frames never interleave on the wire.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: DoipFrame) -> Result<(), SessionError>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// Inbound half of a channel, owned by the session read path.
/// `Ok(None)` means the peer closed the connection cleanly.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Option<DoipFrame>, SessionError>;
}

pub struct ChannelPair {
    pub sink: Arc<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Factory for session channels. `open()` establishes the connection
/// and completes routing activation before returning.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, params: &ConnectionParameters) -> Result<ChannelPair, SessionError>;
}
