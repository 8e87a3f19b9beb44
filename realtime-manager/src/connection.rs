//! The serialized event loop: every state mutation happens here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::delivery::{DeliveryGate, LiveBuffer, merge_ordered};
use crate::history::HistoryFetcher;
use crate::liveness::{LivenessProbe, ProbeReport};
use crate::token::TokenStore;
use crate::transport::{InboundMessage, Operation, Transport, TransportEvent};
use crate::types::{
    Callbacks, ConnectionSnapshot, ConnectionState, Cursor, HistoryFetchReport, HistoryWindow,
    MessageEvent, Result, StatusEvent, StatusKind, SubscriptionCheck,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound on the best-effort unsubscribe issued during teardown.
const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Requests from a [`ConnectionHandle`](crate::ConnectionHandle), answered
/// over the embedded oneshot.
pub(crate) enum Command {
    Subscribe {
        channels: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    Unsubscribe {
        channels: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    SetToken {
        raw: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ConfirmSubscriptions {
        channels: Vec<String>,
        optimistic: bool,
        reply: oneshot::Sender<SubscriptionCheck>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<ConnectionSnapshot>,
    },
}

// ---------------------------------------------------------------------------
// Connection record
// ---------------------------------------------------------------------------

/// Subscription bookkeeping owned by the event loop.
pub(crate) struct Connection {
    state: ConnectionState,
    requested: BTreeSet<String>,
    /// Always a subset of `requested`.
    subscribed: BTreeSet<String>,
    /// Newest cursor seen on a confirmation or a delivered message.
    high_water: Option<Cursor>,
    /// Lower bound of the open gap. `Some` while messages may be missing.
    gap_since: Option<Cursor>,
    gate: DeliveryGate,
    buffer: LiveBuffer,
    /// The current `NetworkProblem` was detected by a failed ping while
    /// receiving. The transport sends no confirmation for it, so a
    /// successful ping or fresh live traffic ends it.
    degraded_by_ping: bool,
    /// Set by a reset and cleared on `Connected`: the next subscribe sends
    /// every requested channel, whatever state came in between.
    needs_full_resubscribe: bool,
}

impl Connection {
    pub fn new(requested: BTreeSet<String>, max_buffered: usize) -> Self {
        Self {
            state: ConnectionState::Uninitialized,
            requested,
            subscribed: BTreeSet::new(),
            high_water: None,
            gap_since: None,
            gate: DeliveryGate::default(),
            buffer: LiveBuffer::new(max_buffered),
            degraded_by_ping: false,
            needs_full_resubscribe: false,
        }
    }

    fn note_cursor(&mut self, cursor: Cursor) {
        self.high_water = Some(self.high_water.map_or(cursor, |hw| hw.max(cursor)));
    }

    /// Start a gap at the high-water mark. A first-ever connection has no
    /// high-water mark and therefore nothing to recover.
    fn open_gap(&mut self) {
        if self.gap_since.is_none() {
            self.gap_since = self.high_water;
            if let Some(since) = self.gap_since {
                tracing::debug!(%since, "Delivery gap opened");
            }
        }
    }

    fn fully_subscribed(&self) -> bool {
        !self.requested.is_empty() && self.requested.is_subset(&self.subscribed)
    }

    fn requested_list(&self) -> Vec<String> {
        self.requested.iter().cloned().collect()
    }

    fn remove_channels(&mut self, channels: &[String]) {
        for channel in channels {
            self.requested.remove(channel);
            self.subscribed.remove(channel);
            self.buffer.forget(channel);
            self.gate.forget(channel);
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

pub(crate) struct EventLoopState {
    pub transport: Arc<dyn Transport>,
    pub conn: Connection,
    pub tokens: TokenStore,
    /// Started once the token covers a requested channel.
    pub probe: Option<LivenessProbe>,
    pub probe_interval: Duration,
    pub probe_reports: mpsc::Sender<ProbeReport>,
    pub history: HistoryFetcher,
    pub callbacks: Option<Callbacks>,
    pub shutdown: CancellationToken,
}

/// Drive the connection until the shutdown token is cancelled.
///
/// `ready` fires once the initial subscribe request has been issued (or the
/// token was found not to cover any requested channel).
pub(crate) async fn run_event_loop(
    mut p: EventLoopState,
    mut events: BoxStream<'static, TransportEvent>,
    mut commands: mpsc::Receiver<Command>,
    mut probe_reports: mpsc::Receiver<ProbeReport>,
    ready: oneshot::Sender<()>,
) {
    p.bootstrap().await;
    let _ = ready.send(());

    let mut events_open = true;
    loop {
        tokio::select! {
            biased;

            _ = p.shutdown.cancelled() => break,

            event = events.next(), if events_open => match event {
                Some(event) => p.handle_event(event).await,
                None => {
                    tracing::warn!("Transport event stream ended");
                    events_open = false;
                }
            },

            command = commands.recv() => match command {
                Some(command) => p.handle_command(command).await,
                None => break,
            },

            Some(report) = probe_reports.recv() => match report {
                ProbeReport::Failed(error) => p.on_ping_failed(&error.to_string()),
                ProbeReport::Recovered(cursor) => p.resume_after_ping(cursor).await,
            },
        }
    }

    p.teardown().await;
}

impl EventLoopState {
    async fn bootstrap(&mut self) {
        if !self.tokens.covers_any(&self.conn.requested) {
            tracing::warn!(
                requested = ?self.conn.requested,
                granted = ?self.tokens.granted_channels(),
                "Token grants none of the requested channels",
            );
            self.conn.state = ConnectionState::TokenFailure;
            self.emit_status(StatusEvent::new(StatusKind::TokenFailure));
            return;
        }
        if let Some(token) = self.tokens.current() {
            self.transport.set_token(token.raw());
        }
        self.ensure_probe();
        self.conn.state = ConnectionState::Connecting;
        tracing::info!(channels = ?self.conn.requested, "Subscribing");
        self.subscribe_transport(self.conn.requested_list()).await;
    }

    async fn teardown(&mut self) {
        self.conn.state = ConnectionState::Disposed;
        if let Some(probe) = self.probe.as_mut() {
            probe.stop();
        }
        self.callbacks = None;
        self.conn.buffer.clear();

        let channels = self.conn.requested_list();
        if !channels.is_empty() {
            match tokio::time::timeout(UNSUBSCRIBE_TIMEOUT, self.transport.unsubscribe(&channels))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Unsubscribe on dispose failed"),
                Err(_) => tracing::debug!("Unsubscribe on dispose timed out"),
            }
        }
        tracing::info!("Connection manager disposed");
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::SubscribeConfirmed { channels, cursor } => {
                self.on_subscribe_confirmed(channels, cursor).await;
            }
            TransportEvent::AccessDenied { channels } => match channels {
                Some(channels) if !channels.is_empty() => self.on_channels_denied(channels),
                _ => self.on_token_failure(),
            },
            TransportEvent::OperationFailed {
                operation,
                category,
                message,
            } => match operation {
                Operation::Unsubscribe => {
                    tracing::debug!(%category, %message, "Ignoring unsubscribe error");
                }
                Operation::Subscribe | Operation::Heartbeat => {
                    let reason = format!("{operation:?} failed ({category}): {message}");
                    self.on_network_problem(&reason);
                }
                Operation::History | Operation::Other => {
                    tracing::warn!(?operation, %category, %message, "Transport operation failed");
                }
            },
            TransportEvent::Message(message) => self.on_message(message).await,
        }
    }

    async fn on_subscribe_confirmed(&mut self, channels: Vec<String>, cursor: Cursor) {
        if self.conn.state == ConnectionState::TokenFailure {
            tracing::debug!(?channels, "Ignoring subscribe confirmation while token is rejected");
            return;
        }

        let confirmed: Vec<String> = channels
            .into_iter()
            .filter(|c| self.conn.requested.contains(c))
            .collect();
        tracing::debug!(?confirmed, %cursor, "Subscribe confirmed");
        self.conn.subscribed.extend(confirmed);

        if !self.conn.fully_subscribed() {
            return;
        }
        if self.conn.gap_since.is_some() && !self.recover_gap(cursor).await {
            return;
        }
        self.conn.note_cursor(cursor);
        self.mark_connected();
    }

    /// End a ping-detected outage: recover the gap up to `cursor`, then
    /// report `Connected` again.
    async fn resume_after_ping(&mut self, cursor: Cursor) {
        if !self.conn.degraded_by_ping
            || self.conn.state != ConnectionState::NetworkProblem
            || !self.conn.fully_subscribed()
        {
            return;
        }
        self.conn.degraded_by_ping = false;
        tracing::info!(%cursor, "Server reachable again");

        if self.conn.gap_since.is_some() && !self.recover_gap(cursor).await {
            return;
        }
        self.conn.note_cursor(cursor);
        self.mark_connected();
    }

    fn on_channels_denied(&mut self, channels: Vec<String>) {
        let mut denied = channels;
        denied.sort();
        denied.dedup();
        tracing::error!(channels = ?denied, "Access denied for channels");

        self.conn.remove_channels(&denied);
        self.conn.degraded_by_ping = false;
        self.conn.state = ConnectionState::SubscriptionFailed;
        self.emit_status(StatusEvent::with_channels(StatusKind::Failed, denied));
    }

    fn on_token_failure(&mut self) {
        tracing::error!(
            expires_in_ms = ?self.tokens.expires_in_ms(chrono::Utc::now()),
            "Access token rejected",
        );
        self.conn.open_gap();
        self.conn.degraded_by_ping = false;
        self.conn.state = ConnectionState::TokenFailure;
        self.emit_status(StatusEvent::new(StatusKind::TokenFailure));
    }

    /// A problem the transport reported. Its own confirmation ends it.
    fn on_network_problem(&mut self, reason: &str) {
        if self.enter_network_problem(reason) {
            self.conn.degraded_by_ping = false;
        }
    }

    /// A failed ping. Nothing from the transport will end it, so remember
    /// where it came from unless a transport-reported problem is already
    /// pending.
    fn on_ping_failed(&mut self, reason: &str) {
        let previous = self.conn.state;
        if !self.enter_network_problem(&format!("ping failed: {reason}")) {
            return;
        }
        if previous.is_receiving() {
            self.conn.degraded_by_ping = true;
        }
    }

    /// Returns `false` if the problem was masked or the loop is not live.
    fn enter_network_problem(&mut self, reason: &str) -> bool {
        match self.conn.state {
            ConnectionState::TokenFailure => {
                tracing::debug!(reason, "Network problem while token is rejected");
                return false;
            }
            ConnectionState::Uninitialized | ConnectionState::Disposed => return false,
            _ => {}
        }
        tracing::warn!(reason, state = ?self.conn.state, "Network problem");
        self.conn.open_gap();
        self.conn.state = ConnectionState::NetworkProblem;
        self.emit_status(StatusEvent::new(StatusKind::NetworkProblem));
        true
    }

    async fn on_message(&mut self, message: InboundMessage) {
        let InboundMessage {
            channel,
            cursor,
            payload,
            publisher,
        } = message;
        if !self.conn.requested.contains(&channel) {
            tracing::trace!(%channel, "Dropping message for unrequested channel");
            return;
        }

        let event = MessageEvent::new(channel, cursor, payload, publisher);
        if self.conn.gap_since.is_none() {
            self.deliver(event);
            return;
        }

        if !self.conn.gate.would_admit(&event.channel, cursor) {
            tracing::trace!(channel = %event.channel, %cursor, "Dropping duplicate message");
            return;
        }
        if self.conn.buffer.push(event) {
            // Live traffic proves the link is back after a ping-detected outage.
            if self.conn.degraded_by_ping {
                self.resume_after_ping(cursor).await;
            }
            return;
        }

        tracing::warn!(
            buffered = self.conn.buffer.len(),
            "Live buffer overflowed while a gap is open",
        );
        self.conn.buffer.clear();
        if self.conn.state != ConnectionState::TokenFailure {
            self.enter_reset();
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { channels, reply } => {
                self.subscribe(channels).await;
                let _ = reply.send(());
            }
            Command::Unsubscribe { channels, reply } => {
                self.unsubscribe(channels).await;
                let _ = reply.send(());
            }
            Command::SetToken { raw, reply } => {
                let result = self.set_token(&raw).await;
                let _ = reply.send(result);
            }
            Command::ConfirmSubscriptions {
                channels,
                optimistic,
                reply,
            } => {
                let check = self.confirm_subscriptions(channels, optimistic);
                let _ = reply.send(check);
            }
            Command::Reset { reply } => {
                if self.conn.state == ConnectionState::TokenFailure {
                    tracing::info!("Reset ignored until a new token is set");
                } else {
                    self.enter_reset();
                }
                let _ = reply.send(());
            }
            Command::Reconnect { reply } => {
                let result = self.reconnect().await;
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn subscribe(&mut self, channels: Vec<String>) {
        let added: Vec<String> = channels
            .into_iter()
            .filter(|c| !c.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|c| !self.conn.requested.contains(c))
            .collect();
        self.conn.requested.extend(added.iter().cloned());

        if self.conn.state == ConnectionState::TokenFailure {
            tracing::info!(channels = ?added, "Recorded channels; waiting for a new token");
            return;
        }

        // After a reset every channel is resubscribed from scratch.
        let full = self.conn.needs_full_resubscribe;
        let targets = if full {
            self.conn.requested_list()
        } else {
            added
        };
        if targets.is_empty() {
            return;
        }

        if full || self.conn.state.is_receiving() || self.conn.state == ConnectionState::Reset {
            self.conn.state = ConnectionState::Connecting;
        }
        tracing::info!(channels = ?targets, "Subscribing");
        self.subscribe_transport(targets).await;
    }

    async fn unsubscribe(&mut self, channels: Vec<String>) {
        let removed: Vec<String> = channels
            .into_iter()
            .filter(|c| self.conn.requested.contains(c))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if removed.is_empty() {
            return;
        }
        self.conn.remove_channels(&removed);
        tracing::info!(channels = ?removed, "Unsubscribing");

        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            outcome = self.transport.unsubscribe(&removed) => outcome,
        };
        if let Err(e) = outcome {
            tracing::debug!(error = %e, "Ignoring unsubscribe error");
        }
    }

    async fn set_token(&mut self, raw: &str) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        self.tokens.set_with(raw, |r| transport.parse_token(r))?;
        transport.set_token(raw);

        if self.conn.state != ConnectionState::TokenFailure {
            return Ok(());
        }
        if !self.tokens.covers_any(&self.conn.requested) {
            tracing::warn!(
                requested = ?self.conn.requested,
                "New token still grants none of the requested channels",
            );
            self.emit_status(StatusEvent::new(StatusKind::TokenFailure));
            return Ok(());
        }

        self.conn.subscribed.clear();
        self.ensure_probe();
        self.conn.state = ConnectionState::Connecting;
        tracing::info!(channels = ?self.conn.requested, "Resubscribing with new token");
        self.subscribe_transport(self.conn.requested_list()).await;
        Ok(())
    }

    fn confirm_subscriptions(&mut self, channels: Vec<String>, optimistic: bool) -> SubscriptionCheck {
        if optimistic {
            let confirmed = self.conn.state.is_receiving()
                && channels.iter().all(|c| self.conn.subscribed.contains(c));
            return SubscriptionCheck::Confirmed(confirmed);
        }

        let mut channels = if channels.is_empty() {
            self.conn.requested_list()
        } else {
            channels
        };
        channels.sort();
        channels.dedup();
        if self.conn.state != ConnectionState::TokenFailure {
            self.enter_reset();
        }
        SubscriptionCheck::Resubscribe(channels)
    }

    async fn reconnect(&mut self) -> Result<()> {
        tracing::info!(state = ?self.conn.state, "Reconnect requested");
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(()),
            outcome = self.transport.reconnect() => outcome,
        };
        if let Err(e) = outcome {
            self.on_network_problem(&format!("reconnect failed: {e}"));
            return Err(e.into());
        }
        Ok(())
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.conn.state,
            requested_channels: self.conn.requested.clone(),
            subscribed_channels: self.conn.subscribed.clone(),
            token_expires_at: self.tokens.current().map(|t| t.expires_at()),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions and delivery
    // -----------------------------------------------------------------------

    fn enter_reset(&mut self) {
        tracing::warn!(state = ?self.conn.state, "Subscriptions must be rebuilt from scratch");
        self.conn.open_gap();
        self.conn.buffer.clear();
        self.conn.subscribed.clear();
        self.conn.degraded_by_ping = false;
        self.conn.needs_full_resubscribe = true;
        self.conn.state = ConnectionState::Reset;
        self.emit_status(StatusEvent::new(StatusKind::Reset));
    }

    fn mark_connected(&mut self) {
        let previous = self.conn.state;
        self.conn.state = ConnectionState::Connected;
        self.conn.degraded_by_ping = false;
        self.conn.needs_full_resubscribe = false;
        tracing::info!(from = ?previous, channels = ?self.conn.requested, "Connected");
        self.emit_status(StatusEvent::with_channels(
            StatusKind::Connected,
            self.conn.requested_list(),
        ));
    }

    fn ensure_probe(&mut self) {
        if self.probe.is_some() {
            return;
        }
        self.probe = Some(LivenessProbe::start(
            Arc::clone(&self.transport),
            self.probe_interval,
            self.probe_reports.clone(),
            &self.shutdown,
        ));
    }

    /// Issue a subscribe request. A failed call is a network problem.
    async fn subscribe_transport(&mut self, channels: Vec<String>) {
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            outcome = self.transport.subscribe(&channels) => outcome,
        };
        if let Err(e) = outcome {
            self.on_network_problem(&format!("subscribe call failed: {e}"));
        }
    }

    /// Deliver the gap's history merged with buffered live traffic, channel
    /// by channel. Returns `false` if the manager was disposed meanwhile.
    async fn recover_gap(&mut self, until: Cursor) -> bool {
        let Some(since) = self.conn.gap_since.take() else {
            return true;
        };
        let window = HistoryWindow {
            channels: self.conn.requested_list(),
            since_cursor: since,
            until_cursor: Some(until),
        };
        tracing::info!(%since, %until, channels = ?window.channels, "Recovering missed messages");

        let mut histories = match self
            .history
            .fetch(self.transport.as_ref(), &window, &self.shutdown)
            .await
        {
            Ok(histories) => histories,
            Err(e) => {
                tracing::debug!(error = %e, "Gap recovery abandoned");
                return false;
            }
        };
        let mut live = self.conn.buffer.drain();

        let mut report = HistoryFetchReport {
            window: window.clone(),
            delivered: BTreeMap::new(),
            failed: BTreeMap::new(),
        };
        for channel in &window.channels {
            let recovered = match histories.remove(channel) {
                Some(Ok(messages)) => messages,
                Some(Err(e)) => {
                    tracing::error!(%channel, error = %e, "Could not recover missed messages");
                    report.failed.insert(channel.clone(), e.to_string());
                    Vec::new()
                }
                None => Vec::new(),
            };
            let buffered = live.remove(channel).unwrap_or_default();
            let mut delivered = 0;
            for event in merge_ordered(recovered, buffered) {
                if self.deliver(event) {
                    delivered += 1;
                }
            }
            report.delivered.insert(channel.clone(), delivered);
        }

        if self.shutdown.is_cancelled() {
            return false;
        }
        if let Some(on_history_fetch) = self
            .callbacks
            .as_ref()
            .and_then(|cb| cb.on_history_fetch.as_ref())
        {
            on_history_fetch(report);
        }
        true
    }

    /// Hand one message to the application if it passes the cursor gate.
    fn deliver(&mut self, event: MessageEvent) -> bool {
        if !self.conn.gate.admit(&event.channel, event.cursor) {
            tracing::trace!(channel = %event.channel, cursor = %event.cursor, "Dropping duplicate message");
            return false;
        }
        self.conn.note_cursor(event.cursor);
        if self.shutdown.is_cancelled() {
            return false;
        }
        match &self.callbacks {
            Some(cb) => {
                (cb.on_message)(event);
                true
            }
            None => false,
        }
    }

    fn emit_status(&self, event: StatusEvent) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::debug!(kind = ?event.kind, channels = ?event.channels, "Emitting status");
        if let Some(cb) = &self.callbacks {
            (cb.on_status)(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|c| (*c).to_string()).collect()
    }

    #[test]
    fn first_connection_opens_no_gap() {
        let mut conn = Connection::new(channels(&["a"]), 10);
        conn.open_gap();
        assert_eq!(conn.gap_since, None);

        conn.note_cursor(Cursor(50));
        conn.note_cursor(Cursor(40));
        conn.open_gap();
        assert_eq!(conn.gap_since, Some(Cursor(50)));

        // A second drop keeps the original lower bound.
        conn.note_cursor(Cursor(60));
        conn.open_gap();
        assert_eq!(conn.gap_since, Some(Cursor(50)));
    }

    #[test]
    fn fully_subscribed_requires_every_requested_channel() {
        let mut conn = Connection::new(channels(&["a", "b"]), 10);
        assert!(!conn.fully_subscribed());
        conn.subscribed.insert("a".to_string());
        assert!(!conn.fully_subscribed());
        conn.subscribed.insert("b".to_string());
        assert!(conn.fully_subscribed());

        conn.remove_channels(&["a".to_string(), "b".to_string()]);
        assert!(!conn.fully_subscribed());
    }

    #[test]
    fn removing_channels_keeps_subset_invariant() {
        let mut conn = Connection::new(channels(&["a", "b"]), 10);
        conn.subscribed = channels(&["a", "b"]);
        conn.remove_channels(&["b".to_string()]);
        assert_eq!(conn.requested, channels(&["a"]));
        assert_eq!(conn.subscribed, channels(&["a"]));
        assert!(conn.subscribed.is_subset(&conn.requested));
    }
}
