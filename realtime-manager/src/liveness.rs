//! Periodic round trip that catches network failures the transport never
//! reports.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::transport::{Transport, TransportError};
use crate::types::Cursor;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome reported by the probe.
#[derive(Debug)]
pub(crate) enum ProbeReport {
    /// One failed attempt. Always classified as a network problem.
    Failed(TransportError),
    /// First successful round trip after a failure, with the service's
    /// current cursor.
    Recovered(Cursor),
}

pub(crate) struct LivenessProbe {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LivenessProbe {
    /// Start probing every `interval`. The first probe fires one full interval
    /// after start. Each failed attempt sends exactly one
    /// [`ProbeReport::Failed`]; a probe that takes longer than `interval`
    /// counts as failed. The first success after a failure sends
    /// [`ProbeReport::Recovered`].
    pub fn start(
        transport: Arc<dyn Transport>,
        interval: Duration,
        reports: mpsc::Sender<ProbeReport>,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let period = interval.max(MIN_INTERVAL);
        let task = tokio::spawn(probe_loop(transport, period, reports, cancel.clone()));
        tracing::debug!(interval_ms = period.as_millis() as u64, "Liveness probe started");
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Cancel the timer. Safe to call more than once.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if self.task.take().is_some() {
            tracing::debug!("Liveness probe stopped");
        }
    }
}

impl Drop for LivenessProbe {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn probe_loop(
    transport: Arc<dyn Transport>,
    period: Duration,
    reports: mpsc::Sender<ProbeReport>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failing = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = tokio::time::timeout(period, transport.ping()) => outcome,
        };
        let report = match outcome {
            Ok(Ok(cursor)) => {
                tracing::trace!(%cursor, "Ping ok");
                if !std::mem::take(&mut failing) {
                    continue;
                }
                tracing::debug!(%cursor, "Server ping recovered");
                ProbeReport::Recovered(cursor)
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Server ping failed, assuming network hiccup");
                failing = true;
                ProbeReport::Failed(e)
            }
            Err(_) => {
                tracing::debug!("Server ping timed out, assuming network hiccup");
                failing = true;
                ProbeReport::Failed(TransportError::new("ping timed out"))
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = reports.send(report) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}
