//! Session core: owns the state machine and coordinates transport,
//! correlation, keep-alive, sequences and flashing.
//!
//! All commands go through `&self`; internal state sits behind locks so
//! the core can be shared across tasks in an `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use doip_codec::{payload_type, uds, DoipFrame, UdsReply};
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectionParameters;
use crate::correlator::{Correlator, DiagnosticResponse};
use crate::error::SessionError;
use crate::flash::{FlashDriver, FlashSet};
use crate::keepalive::KeepAliveScheduler;
use crate::sequence::{executor, SequenceScript};
use crate::session::{SecurityAccessState, SecurityPhase, SessionEvent, SessionState};
use crate::transport::{FrameSink, FrameSource, TcpTransport, Transport};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct SessionCore {
    params: ConnectionParameters,
    transport: Arc<dyn Transport>,
    state: Arc<RwLock<SessionState>>,
    security: RwLock<SecurityAccessState>,
    correlator: Arc<Correlator>,
    keepalive: Arc<KeepAliveScheduler>,
    sink: Mutex<Option<Arc<dyn FrameSink>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<SessionEvent>,
    sequence_cancel: Arc<AtomicBool>,
    script: SyncMutex<Option<SequenceScript>>,
    flash_set: SyncMutex<Option<FlashSet>>,
    flash_driver: SyncMutex<Option<Arc<dyn FlashDriver>>>,
}

impl SessionCore {
    /// Create a session over the production TCP transport.
    pub fn new(params: ConnectionParameters) -> Result<Self, SessionError> {
        Self::with_transport(params, Arc::new(TcpTransport::new()))
    }

    /// Create a session over an arbitrary transport (mocks in tests).
    pub fn with_transport(
        params: ConnectionParameters,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SessionError> {
        params.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let keepalive = Arc::new(KeepAliveScheduler::new(
            params.tester_present_interval,
            params.tester_present,
        ));
        Ok(Self {
            params,
            transport,
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            security: RwLock::new(SecurityAccessState::default()),
            correlator: Arc::new(Correlator::new()),
            keepalive,
            sink: Mutex::new(None),
            reader: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            events,
            sequence_cancel: Arc::new(AtomicBool::new(false)),
            script: SyncMutex::new(None),
            flash_set: SyncMutex::new(None),
            flash_driver: SyncMutex::new(None),
        })
    }

    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn security_state(&self) -> SecurityAccessState {
        self.security.read().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Open the transport, complete routing activation and bring the
    /// session online. Fails with `AlreadyConnected` unless the session
    /// is fully disconnected.
    pub async fn connect(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.write();
            if *state != SessionState::Disconnected {
                return Err(SessionError::AlreadyConnected);
            }
            *state = SessionState::Connecting;
        }
        info!(addr = %self.params.remote_addr(), "connecting");

        let pair = match self.transport.open(&self.params).await {
            Ok(pair) => pair,
            Err(e) => {
                *self.state.write() = SessionState::Disconnected;
                return Err(e);
            }
        };

        *self.sink.lock().await = Some(Arc::clone(&pair.sink));
        self.connected.store(true, Ordering::Relaxed);
        *self.security.write() = SecurityAccessState::default();

        let reader = self.spawn_read_path(pair.source, Arc::clone(&pair.sink));
        *self.reader.lock().await = Some(reader);

        *self.state.write() = SessionState::Connected;
        info!("session connected");

        if self.keepalive.is_enabled() {
            self.keepalive
                .start(
                    pair.sink,
                    self.params.tester_addr,
                    self.params.ecu_addr,
                    Arc::clone(&self.connected),
                )
                .await;
        }

        self.emit(SessionEvent::Connected);
        Ok(())
    }

    fn spawn_read_path(
        &self,
        mut source: Box<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
    ) -> JoinHandle<()> {
        let correlator = Arc::clone(&self.correlator);
        let keepalive = Arc::clone(&self.keepalive);
        let state = Arc::clone(&self.state);
        let connected = Arc::clone(&self.connected);
        let events = self.events.clone();
        let tester_addr = self.params.tester_addr;
        let ecu_addr = self.params.ecu_addr;

        tokio::spawn(async move {
            let reason = loop {
                match source.next_frame().await {
                    Ok(Some(DoipFrame::Diagnostic {
                        source_address,
                        target_address,
                        payload,
                    })) => {
                        if source_address != ecu_addr || target_address != tester_addr {
                            warn!(
                                source = format_args!("0x{source_address:04X}"),
                                target = format_args!("0x{target_address:04X}"),
                                "dropping diagnostic message for other addresses"
                            );
                            continue;
                        }
                        correlator.dispatch(&payload);
                    }
                    Ok(Some(DoipFrame::AliveCheckRequest)) => {
                        debug!("answering alive check");
                        if let Err(e) = sink.send(DoipFrame::alive_check_response(tester_addr)).await
                        {
                            warn!(error = %e, "alive check response failed");
                        }
                    }
                    Ok(Some(DoipFrame::DiagnosticAck { .. })) => {
                        debug!("diagnostic message acknowledged");
                    }
                    Ok(Some(DoipFrame::DiagnosticNack { nack_code, .. })) => {
                        warn!(code = format_args!("0x{nack_code:02X}"), "diagnostic NACK");
                    }
                    Ok(Some(DoipFrame::GenericNack { nack_code })) => {
                        warn!(code = format_args!("0x{nack_code:02X}"), "generic DoIP NACK");
                    }
                    Ok(Some(other)) => {
                        debug!(?other, "ignoring frame");
                    }
                    Ok(None) => break "peer closed connection".to_string(),
                    Err(SessionError::Codec(e)) => {
                        warn!(error = %e, "dropping undecodable frame");
                    }
                    Err(e) => break e.to_string(),
                }
            };

            // A user-initiated disconnect tears this task down itself;
            // only an unexpected loss is reported.
            if *state.read() == SessionState::Disconnecting {
                return;
            }
            warn!(%reason, "connection lost");
            connected.store(false, Ordering::Relaxed);
            keepalive.stop().await;
            correlator.fail_all(&reason);
            *state.write() = SessionState::Disconnected;
            let _ = events.send(SessionEvent::ConnectionLost { reason });
        })
    }

    /// Tear the session down in a fixed order: keep-alive first (joined,
    /// so nothing follows it onto the wire), then pending requests, then
    /// the read path, then the socket.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.write();
            match *state {
                SessionState::Disconnected => return Ok(()),
                SessionState::Connecting | SessionState::Disconnecting => {
                    return Err(SessionError::NotConnected);
                }
                _ => *state = SessionState::Disconnecting,
            }
        }
        info!("disconnecting");

        self.connected.store(false, Ordering::Relaxed);
        self.keepalive.stop().await;
        self.correlator.cancel_all();

        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
            let _ = reader.await;
        }
        if let Some(sink) = self.sink.lock().await.take() {
            sink.close().await;
        }

        *self.security.write() = SecurityAccessState::default();
        *self.state.write() = SessionState::Disconnected;
        self.emit(SessionEvent::Disconnected);
        Ok(())
    }

    fn ensure_online(&self) -> Result<(), SessionError> {
        if self.state().is_online() {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    async fn current_sink(&self) -> Result<Arc<dyn FrameSink>, SessionError> {
        self.sink
            .lock()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(SessionError::NotConnected)
    }

    /// Send a raw UDS request. Returns `None` when the request carries
    /// the suppress-positive-response bit and no reply is awaited; the
    /// reply itself may still be negative, that is the caller's to
    /// inspect.
    pub async fn send_uds(
        &self,
        request: &[u8],
    ) -> Result<Option<DiagnosticResponse>, SessionError> {
        self.ensure_online()?;
        let sink = self.current_sink().await?;

        debug!(request = %hex::encode(request), "sending UDS request");
        if uds::suppresses_response(request) {
            sink.send(DoipFrame::diagnostic(
                self.params.tester_addr,
                self.params.ecu_addr,
                request.to_vec(),
            ))
            .await?;
            return Ok(None);
        }

        let response = self
            .correlator
            .send_and_wait(
                &sink,
                self.params.tester_addr,
                self.params.ecu_addr,
                request.to_vec(),
                self.params.response_timeout,
            )
            .await?;
        debug!(response = %hex::encode(&response.raw), "UDS response");
        Ok(Some(response))
    }

    /// Send a UDS request given as hex command text ("10 01", "1001").
    pub async fn send_uds_text(
        &self,
        text: &str,
    ) -> Result<Option<DiagnosticResponse>, SessionError> {
        let request = uds::parse_hex_request(text)?;
        self.send_uds(&request).await
    }

    /// Send an arbitrary DoIP payload. Diagnostic messages go through
    /// the correlated request path; anything else is written raw with
    /// no reply awaited.
    pub async fn send_doip(
        &self,
        doip_payload_type: u16,
        payload: Vec<u8>,
    ) -> Result<Option<DiagnosticResponse>, SessionError> {
        if doip_payload_type == payload_type::DIAGNOSTIC_MESSAGE {
            return self.send_uds(&payload).await;
        }
        self.ensure_online()?;
        let sink = self.current_sink().await?;
        sink.send(DoipFrame::Other {
            payload_type: doip_payload_type,
            payload,
        })
        .await?;
        Ok(None)
    }

    /// Run the two-step security access handshake at `level`. A zero or
    /// empty seed means the ECU is already unlocked at that level. On
    /// success the session moves to `Authenticated`.
    pub async fn security_access(&self, level: u8, key: &[u8]) -> Result<(), SessionError> {
        if level == 0 || level > 0x3F {
            return Err(SessionError::InvalidParameters(format!(
                "security access level {level} out of range 1..=63"
            )));
        }
        self.ensure_online()?;
        *self.state.write() = SessionState::Authenticating;
        {
            let mut security = self.security.write();
            security.phase = SecurityPhase::SeedRequested;
            security.level = level;
        }

        match self.run_security_handshake(level, key).await {
            Ok(()) => {
                let mut security = self.security.write();
                security.phase = SecurityPhase::Unlocked;
                security.level = level;
                *self.state.write() = SessionState::Authenticated;
                info!(level, "security access unlocked");
                Ok(())
            }
            Err(e) => {
                {
                    let mut security = self.security.write();
                    security.phase = SecurityPhase::Locked;
                    if matches!(e, SessionError::NegativeResponse { .. }) {
                        security.attempts += 1;
                    }
                }
                // Drop back to plain connected unless the transport died
                let mut state = self.state.write();
                if *state == SessionState::Authenticating {
                    *state = SessionState::Connected;
                }
                Err(e)
            }
        }
    }

    async fn run_security_handshake(&self, level: u8, key: &[u8]) -> Result<(), SessionError> {
        let seed_sub = 2 * level - 1;
        let response = self
            .request_expecting_reply(&[uds::service_id::SECURITY_ACCESS, seed_sub])
            .await?;
        let seed = match response.reply {
            UdsReply::Positive { data, .. } => {
                // First byte echoes the sub-function, the rest is the seed
                data.get(1..).unwrap_or_default().to_vec()
            }
            UdsReply::Negative { sid, nrc } => {
                return Err(SessionError::NegativeResponse {
                    service_id: sid,
                    nrc,
                });
            }
        };

        if seed.is_empty() || seed.iter().all(|&b| b == 0) {
            debug!(level, "zero seed, already unlocked");
            return Ok(());
        }
        self.security.write().last_seed = Some(seed);

        let mut key_request = vec![uds::service_id::SECURITY_ACCESS, 2 * level];
        key_request.extend_from_slice(key);
        let response = self.request_expecting_reply(&key_request).await?;
        match response.reply {
            UdsReply::Positive { .. } => Ok(()),
            UdsReply::Negative { sid, nrc } => Err(SessionError::NegativeResponse {
                service_id: sid,
                nrc,
            }),
        }
    }

    async fn request_expecting_reply(
        &self,
        request: &[u8],
    ) -> Result<DiagnosticResponse, SessionError> {
        let sink = self.current_sink().await?;
        self.correlator
            .send_and_wait(
                &sink,
                self.params.tester_addr,
                self.params.ecu_addr,
                request.to_vec(),
                self.params.response_timeout,
            )
            .await
    }

    /// Enable or disable the tester-present keep-alive. An interval, if
    /// given, takes effect on the next tick. Offline the setting is
    /// stored and applied at the next connect.
    pub async fn trigger_tester_present(
        &self,
        enable: bool,
        interval: Option<Duration>,
    ) -> Result<(), SessionError> {
        if let Some(interval) = interval {
            if interval.is_zero() {
                return Err(SessionError::InvalidParameters(
                    "tester-present interval must be non-zero".into(),
                ));
            }
            self.keepalive.set_interval(interval);
        }
        self.keepalive.set_enabled(enable);

        if self.state().is_online() {
            if enable {
                let sink = self.current_sink().await?;
                self.keepalive
                    .start(
                        sink,
                        self.params.tester_addr,
                        self.params.ecu_addr,
                        Arc::clone(&self.connected),
                    )
                    .await;
            } else {
                self.keepalive.stop().await;
            }
        }
        Ok(())
    }

    pub async fn keepalive_running(&self) -> bool {
        self.keepalive.is_running().await
    }

    /// Load a sequence script for later execution.
    pub fn load_sequence(&self, script: SequenceScript) {
        *self.script.lock() = Some(script);
    }

    pub fn load_sequence_json(&self, contents: &str) -> Result<(), SessionError> {
        let script = SequenceScript::from_json_str(contents)?;
        self.load_sequence(script);
        Ok(())
    }

    /// Run the loaded sequence. Steps execute strictly in order and the
    /// run stops at the first failure.
    pub async fn execute_sequence(&self) -> Result<(), SessionError> {
        let script = self
            .script
            .lock()
            .clone()
            .ok_or_else(|| SessionError::InvalidParameters("no sequence loaded".into()))?;
        self.sequence_cancel.store(false, Ordering::Relaxed);
        executor::run(self, &script, &self.sequence_cancel).await
    }

    /// Request cancellation of a running sequence; it stops at the next
    /// step boundary.
    pub fn cancel_sequence(&self) {
        self.sequence_cancel.store(true, Ordering::Relaxed);
    }

    pub(crate) fn emit_event(&self, event: SessionEvent) {
        self.emit(event);
    }

    pub fn load_flash_set(&self, set: FlashSet) {
        *self.flash_set.lock() = Some(set);
    }

    pub fn set_flash_driver(&self, driver: Arc<dyn FlashDriver>) {
        *self.flash_driver.lock() = Some(driver);
    }

    /// Run the configured flash driver over the loaded file set. Flashing
    /// requires an authenticated session.
    pub async fn flash(&self) -> Result<(), SessionError> {
        if self.state() != SessionState::Authenticated {
            return Err(SessionError::Flash(
                "flashing requires an authenticated session".into(),
            ));
        }
        let driver = self
            .flash_driver
            .lock()
            .clone()
            .ok_or_else(|| SessionError::Flash("no flash driver configured".into()))?;
        let set = self
            .flash_set
            .lock()
            .clone()
            .ok_or_else(|| SessionError::Flash("no flash file set loaded".into()))?;
        driver.flash(self, &set).await
    }
}
