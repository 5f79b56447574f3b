//! Tester-present keep-alive scheduler
//!
//! Sends a suppressed tester-present (`3E 80`) at a fixed cadence so
//! the ECU keeps the diagnostic session alive without generating
//! response traffic. `stop()` aborts the task and joins it, so once it
//! returns no further keep-alive frame can reach the wire. Interval
//! changes take effect on the next tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use doip_codec::{uds, DoipFrame};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::transport::FrameSink;

const TESTER_PRESENT_SUPPRESSED: [u8; 2] =
    [uds::service_id::TESTER_PRESENT, uds::SUPPRESS_POS_RSP_BIT];

pub struct KeepAliveScheduler {
    interval_ms: Arc<AtomicU64>,
    enabled: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl KeepAliveScheduler {
    pub fn new(interval: Duration, enabled: bool) -> Self {
        Self {
            interval_ms: Arc::new(AtomicU64::new(interval.as_millis() as u64)),
            enabled: AtomicBool::new(enabled),
            handle: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Picked up by the running task before its next sleep.
    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub async fn is_running(&self) -> bool {
        matches!(&*self.handle.lock().await, Some(h) if !h.is_finished())
    }

    /// Start the cadence task. A second start while the task is alive
    /// is a no-op.
    pub async fn start(
        &self,
        sink: Arc<dyn FrameSink>,
        tester_addr: u16,
        ecu_addr: u16,
        connected: Arc<AtomicBool>,
    ) {
        let mut guard = self.handle.lock().await;
        if matches!(&*guard, Some(h) if !h.is_finished()) {
            return;
        }

        let interval_ms = Arc::clone(&self.interval_ms);
        debug!(
            interval_ms = interval_ms.load(Ordering::Relaxed),
            "starting tester-present keep-alive"
        );

        *guard = Some(tokio::spawn(async move {
            loop {
                let interval = Duration::from_millis(interval_ms.load(Ordering::Relaxed));
                sleep(interval).await;

                if !connected.load(Ordering::Relaxed) {
                    break;
                }
                let frame = DoipFrame::diagnostic(
                    tester_addr,
                    ecu_addr,
                    TESTER_PRESENT_SUPPRESSED.to_vec(),
                );
                match sink.send(frame).await {
                    Ok(()) => trace!("tester-present sent"),
                    Err(e) => {
                        warn!(error = %e, "tester-present send failed, stopping keep-alive");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop the cadence task and wait for it to finish. After this
    /// returns no further tester-present frame will be sent.
    pub async fn stop(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            debug!("keep-alive stopped");
        }
    }
}
