//! Gap recovery: bounded, paginated history retrieval normalized into
//! [`MessageEvent`]s.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use crate::transport::{HistoryEntry, HistoryPage, HistoryRequest, Transport, TransportError};
use crate::types::{Cursor, Error, HistoryError, HistoryWindow, ManagerConfig, MessageEvent, Result};

/// Per-channel recovery outcome. Ordering is guaranteed within a channel only.
pub type ChannelHistories = BTreeMap<String, std::result::Result<Vec<MessageEvent>, HistoryError>>;

/// Paging progress for one channel.
struct Progress {
    entries: Vec<HistoryEntry>,
    after: Cursor,
    pages: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct HistoryFetcher {
    page_size: usize,
    batch_size: usize,
    max_pages: u32,
}

impl HistoryFetcher {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            page_size: config.history_page_size.max(1),
            batch_size: config.history_batch_size.max(1),
            max_pages: config.history_max_pages.max(1),
        }
    }

    /// Retrieve every message with `since_cursor < cursor <= until_cursor` for
    /// each channel in `window`.
    ///
    /// A channel that fails gets an `Err` entry; the others are still
    /// returned. Only cancellation fails the whole call.
    pub async fn fetch(
        &self,
        transport: &dyn Transport,
        window: &HistoryWindow,
        cancel: &CancellationToken,
    ) -> Result<ChannelHistories> {
        let mut channels = window.channels.clone();
        channels.sort();
        channels.dedup();

        let mut results = ChannelHistories::new();
        let mut pending: Vec<(String, Progress)> = Vec::new();

        if channels.len() > 1 {
            let request = HistoryRequest {
                channels: channels.clone(),
                after: window.since_cursor,
                until: window.until_cursor,
                limit: self.batch_size,
            };
            match self.round_trip(transport, &request, cancel).await? {
                Ok(mut page) => {
                    for channel in channels {
                        let entries = page.channels.remove(&channel).unwrap_or_default();
                        let newest = entries.iter().map(|e| e.cursor).max();
                        match newest {
                            Some(after) if entries.len() >= self.batch_size => {
                                pending.push((channel, Progress { entries, after, pages: 1 }));
                            }
                            _ => {
                                let messages = normalize(&channel, entries, window);
                                results.insert(channel, Ok(messages));
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Batch history fetch failed, falling back to per-channel");
                    pending.extend(channels.into_iter().map(|c| (c, self.fresh(window))));
                }
            }
        } else {
            pending.extend(channels.into_iter().map(|c| (c, self.fresh(window))));
        }

        for (channel, progress) in pending {
            let outcome = self.page_channel(transport, &channel, progress, window, cancel).await?;
            if let Err(e) = &outcome {
                tracing::warn!(channel = %channel, error = %e, "History fetch failed");
            }
            results.insert(channel, outcome);
        }
        Ok(results)
    }

    fn fresh(&self, window: &HistoryWindow) -> Progress {
        Progress {
            entries: Vec::new(),
            after: window.since_cursor,
            pages: 0,
        }
    }

    async fn page_channel(
        &self,
        transport: &dyn Transport,
        channel: &str,
        mut progress: Progress,
        window: &HistoryWindow,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<Vec<MessageEvent>, HistoryError>> {
        loop {
            if progress.pages >= self.max_pages {
                match self.has_more(transport, channel, &progress, window, cancel).await? {
                    Ok(false) => break,
                    Ok(true) => {
                        return Ok(Err(HistoryError::PageLimitExceeded {
                            pages: progress.pages,
                        }));
                    }
                    Err(e) => return Ok(Err(HistoryError::Transport(e))),
                }
            }
            let request = HistoryRequest {
                channels: vec![channel.to_string()],
                after: progress.after,
                until: window.until_cursor,
                limit: self.page_size,
            };
            let mut page = match self.round_trip(transport, &request, cancel).await? {
                Ok(page) => page,
                Err(e) => return Ok(Err(HistoryError::Transport(e))),
            };
            progress.pages += 1;

            let entries = page.channels.remove(channel).unwrap_or_default();
            let full = entries.len() >= self.page_size;
            let newest = entries.iter().map(|e| e.cursor).max();
            progress.entries.extend(entries);
            tracing::debug!(
                channel,
                page = progress.pages,
                total = progress.entries.len(),
                "History page received",
            );

            match newest {
                Some(next)
                    if full
                        && next > progress.after
                        && window.until_cursor.is_none_or(|until| next < until) =>
                {
                    progress.after = next;
                }
                _ => break,
            }
        }
        Ok(Ok(normalize(channel, progress.entries, window)))
    }

    /// One-row lookahead after the page cap: a window that ends exactly on a
    /// page boundary is complete, not truncated.
    async fn has_more(
        &self,
        transport: &dyn Transport,
        channel: &str,
        progress: &Progress,
        window: &HistoryWindow,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<bool, TransportError>> {
        let request = HistoryRequest {
            channels: vec![channel.to_string()],
            after: progress.after,
            until: window.until_cursor,
            limit: 1,
        };
        let page = match self.round_trip(transport, &request, cancel).await? {
            Ok(page) => page,
            Err(e) => return Ok(Err(e)),
        };
        let more = page
            .channels
            .get(channel)
            .is_some_and(|entries| entries.iter().any(|e| window.contains(e.cursor)));
        Ok(Ok(more))
    }

    async fn round_trip(
        &self,
        transport: &dyn Transport,
        request: &HistoryRequest,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<HistoryPage, TransportError>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            page = transport.fetch_history(request) => Ok(page),
        }
    }
}

fn normalize(channel: &str, mut entries: Vec<HistoryEntry>, window: &HistoryWindow) -> Vec<MessageEvent> {
    entries.retain(|e| window.contains(e.cursor));
    entries.sort_by_key(|e| e.cursor);
    entries.dedup_by_key(|e| e.cursor);
    entries
        .into_iter()
        .map(|e| MessageEvent::new(channel, e.cursor, e.payload, e.publisher))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures_util::StreamExt;
    use futures_util::stream::BoxStream;

    use super::*;
    use crate::transport::TransportEvent;

    /// In-memory history store that honours the request bounds and limit.
    #[derive(Default)]
    struct Store {
        messages: BTreeMap<String, Vec<u64>>,
        broken: BTreeSet<String>,
        requests: Mutex<Vec<HistoryRequest>>,
    }

    impl Store {
        fn with(channel: &str, cursors: impl IntoIterator<Item = u64>) -> Self {
            let mut store = Store::default();
            store.add(channel, cursors);
            store
        }

        fn add(&mut self, channel: &str, cursors: impl IntoIterator<Item = u64>) {
            self.messages.insert(channel.to_string(), cursors.into_iter().collect());
        }

        fn requests(&self) -> Vec<HistoryRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for Store {
        fn events(&self) -> BoxStream<'static, TransportEvent> {
            futures_util::stream::empty().boxed()
        }
        async fn subscribe(&self, _channels: &[String]) -> std::result::Result<(), TransportError> {
            Ok(())
        }
        async fn unsubscribe(&self, _channels: &[String]) -> std::result::Result<(), TransportError> {
            Ok(())
        }
        async fn fetch_history(
            &self,
            request: &HistoryRequest,
        ) -> std::result::Result<HistoryPage, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            if request.channels.iter().any(|c| self.broken.contains(c)) {
                return Err(TransportError::new("history unavailable"));
            }
            let mut page = HistoryPage::default();
            for channel in &request.channels {
                let entries = self
                    .messages
                    .get(channel)
                    .into_iter()
                    .flatten()
                    .filter(|c| **c > request.after.0 && request.until.is_none_or(|u| **c <= u.0))
                    .take(request.limit)
                    .map(|c| HistoryEntry {
                        cursor: Cursor(*c),
                        payload: serde_json::json!(c),
                        publisher: None,
                    })
                    .collect();
                page.channels.insert(channel.clone(), entries);
            }
            Ok(page)
        }
        async fn ping(&self) -> std::result::Result<Cursor, TransportError> {
            Ok(Cursor(0))
        }
    }

    fn window(channels: &[&str], since: u64, until: Option<u64>) -> HistoryWindow {
        HistoryWindow {
            channels: channels.iter().map(|c| (*c).to_string()).collect(),
            since_cursor: Cursor(since),
            until_cursor: until.map(Cursor),
        }
    }

    fn fetcher(page_size: usize, batch_size: usize, max_pages: u32) -> HistoryFetcher {
        HistoryFetcher::new(&ManagerConfig {
            history_page_size: page_size,
            history_batch_size: batch_size,
            history_max_pages: max_pages,
            ..ManagerConfig::default()
        })
    }

    fn cursors(result: &ChannelHistories, channel: &str) -> Vec<u64> {
        result
            .get(channel)
            .unwrap()
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.cursor.0)
            .collect()
    }

    #[tokio::test]
    async fn single_channel_pages_until_short_page() {
        let store = Store::with("a", 1..=25);
        let result = fetcher(10, 5, 20)
            .fetch(&store, &window(&["a"], 0, None), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(cursors(&result, "a"), (1..=25).collect::<Vec<_>>());
        let afters: Vec<u64> = store.requests().iter().map(|r| r.after.0).collect();
        assert_eq!(afters, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn window_bounds_are_respected() {
        let store = Store::with("a", [5, 10, 15, 20, 25]);
        let result = fetcher(100, 25, 20)
            .fetch(&store, &window(&["a"], 10, Some(20)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cursors(&result, "a"), vec![15, 20]);
    }

    #[tokio::test]
    async fn batch_then_per_channel_continuation() {
        let mut store = Store::with("a", 1..=3);
        store.add("b", 1..=12);
        let result = fetcher(10, 5, 20)
            .fetch(&store, &window(&["b", "a"], 0, None), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(cursors(&result, "a"), vec![1, 2, 3]);
        assert_eq!(cursors(&result, "b"), (1..=12).collect::<Vec<_>>());

        let requests = store.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].channels, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(requests[0].limit, 5);
        assert_eq!(requests[1].channels, vec!["b".to_string()]);
        assert_eq!(requests[1].after, Cursor(5));
    }

    #[tokio::test]
    async fn failing_channel_does_not_fail_the_rest() {
        let mut store = Store::with("a", [1, 2]);
        store.add("b", [3]);
        store.broken.insert("b".to_string());

        let result = fetcher(10, 5, 20)
            .fetch(&store, &window(&["a", "b"], 0, None), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(cursors(&result, "a"), vec![1, 2]);
        assert!(matches!(result.get("b"), Some(Err(HistoryError::Transport(_)))));
    }

    #[tokio::test]
    async fn page_limit_is_reported_not_truncated() {
        let store = Store::with("a", 1..=50);
        let result = fetcher(10, 5, 2)
            .fetch(&store, &window(&["a"], 0, None), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            result.get("a"),
            Some(&Err(HistoryError::PageLimitExceeded { pages: 2 }))
        );
    }

    #[tokio::test]
    async fn window_ending_on_page_cap_is_complete() {
        let store = Store::with("a", 1..=20);
        let result = fetcher(10, 5, 2)
            .fetch(&store, &window(&["a"], 0, None), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cursors(&result, "a"), (1..=20).collect::<Vec<_>>());

        let requests = store.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].after, Cursor(20));
        assert_eq!(requests[2].limit, 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_fetch() {
        let store = Store::with("a", [1]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fetcher(10, 5, 2)
            .fetch(&store, &window(&["a"], 0, None), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(store.requests().is_empty());
    }
}
