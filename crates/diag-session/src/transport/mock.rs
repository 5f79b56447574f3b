//! Scripted in-memory transport for tests
//!
//! Plays the ECU side of a session: accepts routing activation, answers
//! diagnostic requests from a scripted table (exact match first, then
//! prefix, then a generic positive echo) and records every sent frame
//! so tests can assert on outbound traffic.

use std::sync::Arc;

use async_trait::async_trait;
use doip_codec::{uds, DoipFrame};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::ConnectionParameters;
use crate::error::SessionError;
use crate::transport::{ChannelPair, FrameSink, FrameSource, Transport};

/// Knobs that change how the scripted ECU behaves
#[derive(Debug, Clone, Default)]
pub struct MockBehaviour {
    /// Deny routing activation with this response code
    pub deny_activation: Option<u8>,
    /// Swallow every diagnostic request without replying
    pub silent: bool,
    /// Refuse to open the channel at all
    pub refuse_connection: bool,
}

#[derive(Default)]
struct MockState {
    /// (request, reply) pairs; exact match takes priority over prefix
    exact: Vec<(Vec<u8>, Vec<u8>)>,
    prefix: Vec<(Vec<u8>, Vec<u8>)>,
    /// Requests swallowed without any reply
    ignored: Vec<Vec<u8>>,
    sent: Vec<DoipFrame>,
}

/// Scripted ECU transport shared between a test and the session under
/// test. Cloning the handle shares the script and the sent-frame log.
#[derive(Clone, Default)]
pub struct MockTransport {
    behaviour: MockBehaviour,
    state: Arc<Mutex<MockState>>,
    inject_tx: Arc<Mutex<Option<mpsc::UnboundedSender<DoipFrame>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behaviour(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            ..Self::default()
        }
    }

    /// Script an exact request to reply mapping.
    pub fn respond(&self, request: &[u8], reply: &[u8]) {
        self.state
            .lock()
            .exact
            .push((request.to_vec(), reply.to_vec()));
    }

    /// Script a reply for any request starting with `prefix`.
    pub fn respond_prefix(&self, prefix: &[u8], reply: &[u8]) {
        self.state
            .lock()
            .prefix
            .push((prefix.to_vec(), reply.to_vec()));
    }

    /// Swallow this exact request without replying.
    pub fn ignore(&self, request: &[u8]) {
        self.state.lock().ignored.push(request.to_vec());
    }

    /// Push an unsolicited frame to the session, as if the ECU sent it.
    pub fn inject(&self, frame: DoipFrame) -> bool {
        match self.inject_tx.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Simulate the peer dropping the connection.
    pub fn drop_connection(&self) {
        *self.inject_tx.lock() = None;
    }

    /// Every frame the session has sent, in order.
    pub fn sent_frames(&self) -> Vec<DoipFrame> {
        self.state.lock().sent.clone()
    }

    /// UDS payloads of sent diagnostic frames, in order.
    pub fn sent_uds(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|f| match f {
                DoipFrame::Diagnostic { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    fn reply_for(&self, request: &[u8]) -> Option<Vec<u8>> {
        if self.behaviour.silent || uds::suppresses_response(request) {
            return None;
        }
        let state = self.state.lock();
        if state.ignored.iter().any(|req| req == request) {
            return None;
        }
        if let Some((_, reply)) = state.exact.iter().find(|(req, _)| req == request) {
            return Some(reply.clone());
        }
        if let Some((_, reply)) = state
            .prefix
            .iter()
            .find(|(prefix, _)| request.starts_with(prefix))
        {
            return Some(reply.clone());
        }
        // Generic positive echo: SID+0x40 followed by the request tail
        let mut reply = vec![request.first()?.wrapping_add(uds::POSITIVE_RESPONSE_OFFSET)];
        reply.extend_from_slice(&request[1..]);
        Some(reply)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, params: &ConnectionParameters) -> Result<ChannelPair, SessionError> {
        if self.behaviour.refuse_connection {
            return Err(SessionError::Connection("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inject_tx.lock() = Some(tx);

        if let Some(code) = self.behaviour.deny_activation {
            return Err(SessionError::ActivationFailed(format!(
                "gateway denied activation with code 0x{code:02X}"
            )));
        }

        let sink = Arc::new(MockSink {
            transport: self.clone(),
            ecu_addr: params.ecu_addr,
            tester_addr: params.tester_addr,
        });
        let source = Box::new(MockSource { rx });
        Ok(ChannelPair { sink, source })
    }
}

struct MockSink {
    transport: MockTransport,
    ecu_addr: u16,
    tester_addr: u16,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&self, frame: DoipFrame) -> Result<(), SessionError> {
        let reply = match &frame {
            DoipFrame::Diagnostic { payload, .. } => self
                .transport
                .reply_for(payload)
                .map(|uds| DoipFrame::diagnostic(self.ecu_addr, self.tester_addr, uds)),
            _ => None,
        };

        self.transport.state.lock().sent.push(frame);

        if let Some(reply) = reply {
            self.transport.inject(reply);
        }
        Ok(())
    }

    async fn close(&self) {
        self.transport.drop_connection();
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<DoipFrame>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn next_frame(&mut self) -> Result<Option<DoipFrame>, SessionError> {
        Ok(self.rx.recv().await)
    }
}
