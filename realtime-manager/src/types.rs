//! Public types for the realtime-manager crate.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub(crate) const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
pub(crate) const DEFAULT_HISTORY_PAGE_SIZE: usize = 100;
pub(crate) const DEFAULT_HISTORY_BATCH_SIZE: usize = 25;
pub(crate) const DEFAULT_HISTORY_MAX_PAGES: u32 = 20;
pub(crate) const DEFAULT_MAX_BUFFERED_MESSAGES: usize = 1_000;
pub(crate) const DEFAULT_COMMAND_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Service-assigned delivery-order marker.
///
/// The broadcast service stamps every message with a 17-digit timetoken
/// (100 ns ticks since the Unix epoch). Cursors are compared for ordering and
/// gap detection only; they are never derived from the local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl Cursor {
    const TICKS_PER_MS: u64 = 10_000;

    /// Build a cursor from a Unix timestamp in milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        Cursor(ms.saturating_mul(Self::TICKS_PER_MS))
    }

    /// Milliseconds since the Unix epoch that this cursor encodes.
    pub fn as_millis(self) -> u64 {
        self.0 / Self::TICKS_PER_MS
    }

    /// Wall-clock view of the cursor.
    pub fn timestamp(self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.as_millis() as i64).unwrap_or_default()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Events delivered to the application
// ---------------------------------------------------------------------------

/// A message delivered to the application, live or recovered from history.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub channel: String,
    pub message: serde_json::Value,
    pub cursor: Cursor,
    /// Derived from `cursor`, not from the time the message reached this process.
    pub received_at: DateTime<Utc>,
    pub publisher: Option<String>,
}

impl MessageEvent {
    pub fn new(
        channel: impl Into<String>,
        cursor: Cursor,
        message: serde_json::Value,
        publisher: Option<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            message,
            cursor,
            received_at: cursor.timestamp(),
            publisher,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusKind {
    Connected,
    NetworkProblem,
    TokenFailure,
    /// Specific channels were denied; the rest stay subscribed.
    Failed,
    /// Every channel must be resubscribed from scratch.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub kind: StatusKind,
    pub channels: Option<Vec<String>>,
}

impl StatusEvent {
    pub(crate) fn new(kind: StatusKind) -> Self {
        Self {
            kind,
            channels: None,
        }
    }

    pub(crate) fn with_channels(kind: StatusKind, channels: Vec<String>) -> Self {
        Self {
            kind,
            channels: Some(channels),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    NetworkProblem,
    TokenFailure,
    SubscriptionFailed,
    Reset,
    Disposed,
}

impl ConnectionState {
    /// States in which confirmed subscriptions are delivering messages.
    pub fn is_receiving(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::SubscriptionFailed
        )
    }
}

/// Point-in-time view of the manager, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub requested_channels: BTreeSet<String>,
    pub subscribed_channels: BTreeSet<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Result of [`confirm_subscriptions`](crate::ConnectionHandle::confirm_subscriptions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionCheck {
    /// Pessimistic check: these channels must be resubscribed.
    Resubscribe(Vec<String>),
    /// Optimistic check: whether every named channel is currently confirmed.
    Confirmed(bool),
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// The interval of missed messages to recover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryWindow {
    pub channels: Vec<String>,
    /// Exclusive lower bound.
    pub since_cursor: Cursor,
    /// Inclusive upper bound; open-ended when `None`.
    pub until_cursor: Option<Cursor>,
}

impl HistoryWindow {
    pub fn contains(&self, cursor: Cursor) -> bool {
        cursor > self.since_cursor && self.until_cursor.is_none_or(|until| cursor <= until)
    }
}

/// Outcome of an automatic gap recovery, handed to `on_history_fetch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryFetchReport {
    pub window: HistoryWindow,
    /// Messages delivered per channel (history and buffered live traffic).
    pub delivered: BTreeMap<String, usize>,
    /// Channels whose history could not be loaded, with the reason.
    pub failed: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

pub type MessageCallback = Box<dyn Fn(MessageEvent) + Send + Sync>;
pub type StatusCallback = Box<dyn Fn(StatusEvent) + Send + Sync>;
pub type HistoryFetchCallback = Box<dyn Fn(HistoryFetchReport) + Send + Sync>;

/// Application callbacks registered at initialization.
pub struct Callbacks {
    pub on_message: MessageCallback,
    pub on_status: StatusCallback,
    pub on_history_fetch: Option<HistoryFetchCallback>,
}

impl Callbacks {
    pub fn new(
        on_message: impl Fn(MessageEvent) + Send + Sync + 'static,
        on_status: impl Fn(StatusEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_message: Box::new(on_message),
            on_status: Box::new(on_status),
            on_history_fetch: None,
        }
    }

    pub fn with_history_fetch(
        mut self,
        on_history_fetch: impl Fn(HistoryFetchReport) + Send + Sync + 'static,
    ) -> Self {
        self.on_history_fetch = Some(Box::new(on_history_fetch));
        self
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for a [`ConnectionManager`](crate::ConnectionManager).
///
/// Deserializable so hosts can embed it in their own config files; missing
/// fields fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Liveness probe interval. Bounds worst-case detection of silent failures.
    pub ping_interval_ms: u64,
    /// Messages requested per page when paging a single channel.
    pub history_page_size: usize,
    /// Per-channel cap for the multi-channel batch request.
    pub history_batch_size: usize,
    /// Upper bound on pages fetched for one channel before giving up.
    pub history_max_pages: u32,
    /// Live messages held back while a gap is open before forcing a reset.
    pub max_buffered_messages: usize,
    pub command_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            history_batch_size: DEFAULT_HISTORY_BATCH_SIZE,
            history_max_pages: DEFAULT_HISTORY_MAX_PAGES,
            max_buffered_messages: DEFAULT_MAX_BUFFERED_MESSAGES,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid token format: {0}")]
    InvalidTokenFormat(String),

    #[error("at least one channel is required")]
    NoChannels,

    #[error("connection manager has been disposed")]
    Disposed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why one channel's history could not be recovered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Transport(TransportError),

    #[error("history window exceeds {pages} pages")]
    PageLimitExceeded { pages: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_maps_to_wall_clock() {
        let cursor = Cursor(17_000_000_000_000_000);
        assert_eq!(cursor.as_millis(), 1_700_000_000_000);
        assert_eq!(cursor.timestamp().timestamp_millis(), 1_700_000_000_000);
        assert_eq!(Cursor::from_millis(1_700_000_000_000), cursor);
    }

    #[test]
    fn message_event_received_at_follows_cursor() {
        let event = MessageEvent::new(
            "room1",
            Cursor::from_millis(1_700_000_000_123),
            serde_json::json!({"text": "hi"}),
            None,
        );
        assert_eq!(event.received_at.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn history_window_bounds() {
        let window = HistoryWindow {
            channels: vec!["a".into()],
            since_cursor: Cursor(10),
            until_cursor: Some(Cursor(20)),
        };
        assert!(!window.contains(Cursor(10)));
        assert!(window.contains(Cursor(11)));
        assert!(window.contains(Cursor(20)));
        assert!(!window.contains(Cursor(21)));

        let open = HistoryWindow {
            until_cursor: None,
            ..window
        };
        assert!(open.contains(Cursor(u64::MAX)));
    }

    #[test]
    fn config_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.ping_interval_ms, 30_000);
        assert_eq!(config.history_batch_size, 25);
        assert_eq!(config.history_page_size, 100);
    }

    #[test]
    fn config_partial_json_uses_defaults() {
        let config: ManagerConfig =
            serde_json::from_str(r#"{"ping_interval_ms": 5000, "history_max_pages": 3}"#)
                .unwrap();
        assert_eq!(config.ping_interval_ms, 5000);
        assert_eq!(config.history_max_pages, 3);
        assert_eq!(config.max_buffered_messages, DEFAULT_MAX_BUFFERED_MESSAGES);
    }

    #[test]
    fn receiving_states() {
        assert!(ConnectionState::Connected.is_receiving());
        assert!(ConnectionState::SubscriptionFailed.is_receiving());
        assert!(!ConnectionState::NetworkProblem.is_receiving());
        assert!(!ConnectionState::Connecting.is_receiving());
    }
}
