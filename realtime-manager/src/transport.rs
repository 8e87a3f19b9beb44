//! The broadcast-service capability injected into the manager.
//!
//! The manager never touches sockets or framing. A host wraps its broadcast
//! SDK in a [`Transport`] and reports everything the SDK observes as
//! [`TransportEvent`]s; all classification of those events happens inside the
//! connection loop.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::token::{TokenGrant, decode_token};
use crate::types::Cursor;

/// Operation a failed status report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Subscribe,
    Heartbeat,
    Unsubscribe,
    History,
    Other,
}

/// A live message as reported by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub channel: String,
    pub cursor: Cursor,
    pub payload: serde_json::Value,
    pub publisher: Option<String>,
}

/// Status and message stream emitted by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The service confirmed a subscription for `channels`. `cursor` is the
    /// service's position at the time of the confirmation.
    SubscribeConfirmed { channels: Vec<String>, cursor: Cursor },
    /// Access was denied. `None` (or an empty list) means no channel detail
    /// was given, i.e. the token itself was rejected.
    AccessDenied { channels: Option<Vec<String>> },
    /// An operation failed without an authorization error.
    OperationFailed {
        operation: Operation,
        category: String,
        message: String,
    },
    Message(InboundMessage),
}

/// One stored message returned by a history request.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub cursor: Cursor,
    pub payload: serde_json::Value,
    pub publisher: Option<String>,
}

/// A single history round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub channels: Vec<String>,
    /// Exclusive lower bound.
    pub after: Cursor,
    /// Inclusive upper bound.
    pub until: Option<Cursor>,
    /// Maximum entries returned per channel, oldest first.
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    pub channels: BTreeMap<String, Vec<HistoryEntry>>,
}

/// Raw failure reported by the transport. The manager decides what it means.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub code: Option<i32>,
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

/// Capability the manager needs from the broadcast service SDK.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Stream of status events and inbound messages. Called once, at
    /// initialization.
    fn events(&self) -> BoxStream<'static, TransportEvent>;

    /// Issue a subscribe request. Returns once the request is issued; the
    /// outcome arrives as a [`TransportEvent`].
    async fn subscribe(&self, channels: &[String]) -> Result<(), TransportError>;

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), TransportError>;

    async fn fetch_history(&self, request: &HistoryRequest) -> Result<HistoryPage, TransportError>;

    /// Unauthenticated round trip returning the service's current cursor.
    async fn ping(&self) -> Result<Cursor, TransportError>;

    /// Parse an access token into its grants.
    fn parse_token(&self, raw: &str) -> crate::Result<TokenGrant> {
        decode_token(raw)
    }

    /// Hand an accepted token to the SDK for subsequent requests.
    fn set_token(&self, _raw: &str) {}

    /// Ask the SDK to re-establish its connection.
    async fn reconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
