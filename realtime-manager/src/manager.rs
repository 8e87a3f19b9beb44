//! Public entry point: [`ConnectionManager`] and [`ConnectionHandle`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::{Command, Connection, EventLoopState, run_event_loop};
use crate::history::{ChannelHistories, HistoryFetcher};
use crate::token::TokenStore;
use crate::transport::Transport;
use crate::types::{
    Callbacks, ConnectionSnapshot, Error, HistoryWindow, ManagerConfig, Result, SubscriptionCheck,
};

/// Pending liveness reports. The probe waits rather than dropping a report.
const PROBE_REPORT_CAPACITY: usize = 4;

/// Builds a connection over an injected [`Transport`].
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ManagerConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: ManagerConfig) -> Self {
        Self { transport, config }
    }

    /// Start the connection: store the token and issue the initial
    /// subscribe. The liveness probe starts with it.
    ///
    /// Returns as soon as the subscribe request is issued; whether it
    /// succeeded is reported through `on_status`. A token that grants none
    /// of `channels` emits `TokenFailure` without contacting the transport,
    /// and nothing is pinged until [`ConnectionHandle::set_token`] supplies
    /// a token that does.
    ///
    /// # Errors
    ///
    /// [`Error::NoChannels`] for an empty channel list and
    /// [`Error::InvalidTokenFormat`] if `token` cannot be parsed.
    pub async fn initialize<I, S>(
        self,
        channels: I,
        token: &str,
        callbacks: Callbacks,
    ) -> Result<ConnectionHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requested: BTreeSet<String> = channels
            .into_iter()
            .map(Into::into)
            .filter(|c: &String| !c.is_empty())
            .collect();
        if requested.is_empty() {
            return Err(Error::NoChannels);
        }

        let transport = self.transport;
        let mut tokens = TokenStore::new();
        tokens.set_with(token, |raw| transport.parse_token(raw))?;

        let shutdown = CancellationToken::new();
        let events = transport.events();
        let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity.max(1));
        let (probe_tx, probe_rx) = mpsc::channel(PROBE_REPORT_CAPACITY);
        let history = HistoryFetcher::new(&self.config);

        tracing::info!(channels = ?requested, "Initializing connection manager");
        let state = EventLoopState {
            transport: Arc::clone(&transport),
            conn: Connection::new(requested, self.config.max_buffered_messages),
            tokens,
            probe: None,
            probe_interval: Duration::from_millis(self.config.ping_interval_ms),
            probe_reports: probe_tx,
            history: history.clone(),
            callbacks: Some(callbacks),
            shutdown: shutdown.clone(),
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(run_event_loop(
            state, events, command_rx, probe_rx, ready_tx,
        ));

        let handle = ConnectionHandle {
            commands: command_tx,
            shutdown,
            task: Mutex::new(Some(task)),
            transport,
            history,
        };
        ready_rx.await.map_err(|_| Error::Disposed)?;
        Ok(handle)
    }
}

/// Handle to a running connection.
///
/// Dropping the handle shuts the connection down; call
/// [`dispose`](ConnectionHandle::dispose) to also wait until no further
/// callbacks can fire.
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    transport: Arc<dyn Transport>,
    history: HistoryFetcher,
}

impl ConnectionHandle {
    /// Add channels to the requested set and subscribe to them.
    pub async fn subscribe<I, S>(&self, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        self.request(|reply| Command::Subscribe { channels, reply })
            .await
    }

    /// Remove channels from the requested set. Transport errors are ignored.
    pub async fn unsubscribe<I, S>(&self, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        self.request(|reply| Command::Unsubscribe { channels, reply })
            .await
    }

    /// Replace the access token. If the previous token was rejected, the
    /// requested channels are resubscribed.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTokenFormat`] if `token` cannot be parsed; the
    /// previous token stays active.
    pub async fn set_token(&self, token: &str) -> Result<()> {
        let raw = token.to_string();
        self.request(|reply| Command::SetToken { raw, reply })
            .await?
    }

    /// Pessimistic (`optimistic == false`): returns the channels that must be
    /// resubscribed and resets the connection. Optimistic: reports whether
    /// every channel is currently confirmed.
    pub async fn confirm_subscriptions<I, S>(
        &self,
        channels: I,
        optimistic: bool,
    ) -> Result<SubscriptionCheck>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        self.request(|reply| Command::ConfirmSubscriptions {
            channels,
            optimistic,
            reply,
        })
        .await
    }

    /// Fetch history for `window`. Per-channel failures are returned as
    /// `Err` entries in the map.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if `cancel` fires, [`Error::Disposed`] if the
    /// connection is disposed while the fetch is running.
    pub async fn fetch_history(
        &self,
        window: &HistoryWindow,
        cancel: &CancellationToken,
    ) -> Result<ChannelHistories> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Disposed);
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::Disposed),
            result = self.history.fetch(self.transport.as_ref(), window, cancel) => result,
        }
    }

    /// Force a full resubscription: emits `Reset` and marks every channel
    /// unconfirmed.
    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Ask the transport to re-establish its connection.
    pub async fn reconnect(&self) -> Result<()> {
        self.request(|reply| Command::Reconnect { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<ConnectionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stop the probe, unsubscribe everything and release the callbacks.
    /// Safe to call more than once; no callback fires after this returns.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        let mut task = self.task.lock().await;
        let Some(task) = task.take() else {
            return;
        };
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Event loop task failed");
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Disposed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::Disposed)?;
        reply_rx.await.map_err(|_| Error::Disposed)
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
