//! Connection manager for a realtime publish/subscribe broadcast service.
//!
//! Keeps a long-lived channel subscription alive over an injected
//! [`Transport`], classifies everything the transport reports, and makes
//! sure the application never silently misses a message across a
//! disconnection.
//!
//! # Features
//! - Single serialized event loop owning all connection state
//! - Access token parsing with read-grant and expiry extraction
//! - Liveness probe for failures the transport never reports
//! - Gap recovery on reconnect, merged with live traffic in cursor order
//! - Per-channel duplicate suppression by cursor
//!
//! # Example
//! ```no_run
//! # use std::sync::Arc;
//! # async fn example(
//! #     transport: Arc<dyn realtime_manager::Transport>,
//! #     token: &str,
//! # ) -> Result<(), realtime_manager::Error> {
//! use realtime_manager::{Callbacks, ConnectionManager, StatusKind};
//!
//! let callbacks = Callbacks::new(
//!     |msg| println!("{} @ {}: {}", msg.channel, msg.cursor, msg.message),
//!     |status| {
//!         if status.kind == StatusKind::TokenFailure {
//!             println!("token rejected, fetch a new one");
//!         }
//!     },
//! );
//!
//! let handle = ConnectionManager::new(transport)
//!     .initialize(["room1"], token, callbacks)
//!     .await?;
//! handle.subscribe(["room2"]).await?;
//! handle.dispose().await;
//! # Ok(())
//! # }
//! ```

mod connection;
mod delivery;
mod history;
mod liveness;
mod manager;
mod token;
mod transport;
mod types;

pub use history::ChannelHistories;
pub use manager::{ConnectionHandle, ConnectionManager};
pub use token::{
    AccessToken, TokenClaims, TokenGrant, TokenResources, TokenStore, decode_claims, decode_token,
    encode_token, permission,
};
pub use transport::{
    HistoryEntry, HistoryPage, HistoryRequest, InboundMessage, Operation, Transport,
    TransportError, TransportEvent,
};
pub use types::{
    Callbacks, ConnectionSnapshot, ConnectionState, Cursor, Error, HistoryError,
    HistoryFetchCallback, HistoryFetchReport, HistoryWindow, ManagerConfig, MessageCallback,
    MessageEvent, Result, StatusCallback, StatusEvent, StatusKind, SubscriptionCheck,
};
