//! Conversation history and read receipts over the REST backend.
//!
//! The [`ChatApi`] trait is the seam between the engine and the backend:
//! [`http::HttpChatApi`] talks to the real service, [`memory::InMemoryChatApi`]
//! backs tests. [`HistoryFetcher`] adds the paging rules on top.

pub mod http;
pub mod memory;

use std::future::Future;
use std::time::Duration;

use matchsync_proto::message::{HistoryMessage, MessageId, UserId};

use crate::config::SyncTimings;

/// Errors returned by the REST backend.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response.
    #[error("request failed: {0}")]
    Request(String),

    /// The backend answered with a non-success status.
    #[error("backend returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The response body was not the expected JSON.
    #[error("invalid response body: {0}")]
    Decode(String),

    /// The request did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// No base URL is configured.
    #[error("no api base url configured")]
    NotConfigured,
}

/// REST operations the engine needs from the backend.
///
/// Implementations are scoped to the local user; `other` is always the
/// conversation partner.
pub trait ChatApi: Send + Sync + 'static {
    /// Fetch up to `limit` messages of the conversation with `other`, newest
    /// first. With `before`, only messages whose id is smaller are returned.
    ///
    /// `Ok(None)` means the backend reported no history at all.
    fn fetch_history(
        &self,
        other: UserId,
        limit: usize,
        before: Option<MessageId>,
    ) -> impl Future<Output = Result<Option<Vec<HistoryMessage>>, ApiError>> + Send;

    /// Mark every message from `sender` up to and including `last_read` as read.
    fn mark_read(
        &self,
        sender: UserId,
        last_read: MessageId,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// One page of history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Messages as returned, newest first.
    pub messages: Vec<HistoryMessage>,
    /// Whether older messages may exist.
    ///
    /// A full page is taken to mean more may exist; an exact multiple of the
    /// page size therefore costs one extra empty request.
    pub has_more: bool,
}

impl Page {
    fn from_response(messages: Option<Vec<HistoryMessage>>, limit: usize) -> Self {
        let messages = messages.unwrap_or_default();
        let has_more = limit > 0 && messages.len() >= limit;
        Self { messages, has_more }
    }
}

/// Retrieves pages of a single conversation and sends its read receipts.
///
/// Every request is bounded by the configured request timeout, so a
/// backend that never answers surfaces as [`ApiError::Timeout`] instead of
/// stalling the caller.
#[derive(Debug, Clone)]
pub struct HistoryFetcher<A> {
    api: A,
    other: UserId,
    initial_page_size: usize,
    older_page_size: usize,
    request_timeout: Duration,
}

impl<A: ChatApi> HistoryFetcher<A> {
    /// Fetcher for the conversation with `other`.
    pub fn new(api: A, other: UserId, timings: &SyncTimings) -> Self {
        Self {
            api,
            other,
            initial_page_size: timings.initial_page_size,
            older_page_size: timings.older_page_size,
            request_timeout: timings.request_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        request: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| ApiError::Timeout(self.request_timeout))?
    }

    /// Newest messages of the conversation.
    ///
    /// # Errors
    ///
    /// Propagates the backend's [`ApiError`].
    pub async fn initial(&self) -> Result<Page, ApiError> {
        let messages = self
            .bounded(self.api.fetch_history(self.other, self.initial_page_size, None))
            .await?;
        let page = Page::from_response(messages, self.initial_page_size);
        tracing::debug!(
            other = %self.other,
            count = page.messages.len(),
            has_more = page.has_more,
            "initial history loaded"
        );
        Ok(page)
    }

    /// Messages older than `before`, which should be the smallest real id
    /// currently known.
    ///
    /// # Errors
    ///
    /// Propagates the backend's [`ApiError`].
    pub async fn older(&self, before: MessageId) -> Result<Page, ApiError> {
        let messages = self
            .bounded(
                self.api
                    .fetch_history(self.other, self.older_page_size, Some(before)),
            )
            .await?;
        let page = Page::from_response(messages, self.older_page_size);
        tracing::debug!(
            other = %self.other,
            %before,
            count = page.messages.len(),
            has_more = page.has_more,
            "older history loaded"
        );
        Ok(page)
    }

    /// Snapshot of the newest messages, used by the poll loop.
    ///
    /// Same request as [`initial`](Self::initial); `has_more` lets a session
    /// whose initial load failed learn about older history from a poll.
    ///
    /// # Errors
    ///
    /// Propagates the backend's [`ApiError`].
    pub async fn poll(&self) -> Result<Page, ApiError> {
        let messages = self
            .bounded(self.api.fetch_history(self.other, self.initial_page_size, None))
            .await?;
        Ok(Page::from_response(messages, self.initial_page_size))
    }

    /// Tell the backend every message from the partner up to `last_read`
    /// has been read.
    ///
    /// # Errors
    ///
    /// Propagates the backend's [`ApiError`].
    pub async fn mark_read(&self, last_read: MessageId) -> Result<(), ApiError> {
        self.bounded(self.api.mark_read(self.other, last_read)).await
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryChatApi;
    use super::*;

    const ME: UserId = UserId::new(1);
    const THEM: UserId = UserId::new(2);

    fn fetcher(api: InMemoryChatApi) -> HistoryFetcher<InMemoryChatApi> {
        HistoryFetcher::new(api, THEM, &SyncTimings::default())
    }

    fn seed(api: &InMemoryChatApi, count: i64) {
        for id in 1..=count {
            let (from, to) = if id % 2 == 0 { (ME, THEM) } else { (THEM, ME) };
            api.push_message(from, to, MessageId::new(id), format!("m{id}"));
        }
    }

    #[tokio::test]
    async fn full_initial_page_reports_more() {
        let api = InMemoryChatApi::new(ME);
        seed(&api, 25);
        let page = fetcher(api).initial().await.unwrap();
        assert_eq!(page.messages.len(), 20);
        assert!(page.has_more);
        assert_eq!(page.messages[0].id, MessageId::new(25), "newest first");
    }

    #[tokio::test]
    async fn short_page_reports_no_more() {
        let api = InMemoryChatApi::new(ME);
        seed(&api, 3);
        let page = fetcher(api).initial().await.unwrap();
        assert_eq!(page.messages.len(), 3);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn older_pages_use_cursor_and_smaller_size() {
        let api = InMemoryChatApi::new(ME);
        seed(&api, 40);
        let fetcher = fetcher(api);
        let page = fetcher.older(MessageId::new(21)).await.unwrap();
        assert_eq!(page.messages.len(), 15);
        assert!(page.has_more);
        assert!(page.messages.iter().all(|m| m.id < MessageId::new(21)));

        let last = fetcher.older(MessageId::new(6)).await.unwrap();
        assert_eq!(last.messages.len(), 5);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn exact_multiple_costs_one_empty_request() {
        let api = InMemoryChatApi::new(ME);
        seed(&api, 20);
        let fetcher = fetcher(api);
        let first = fetcher.initial().await.unwrap();
        assert!(first.has_more);
        let next = fetcher.older(MessageId::new(1)).await.unwrap();
        assert!(next.messages.is_empty());
        assert!(!next.has_more);
    }

    #[tokio::test]
    async fn null_history_is_an_empty_page() {
        let api = InMemoryChatApi::new(ME);
        let page = fetcher(api).initial().await.unwrap();
        assert!(page.messages.is_empty());
        assert!(!page.has_more);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let api = InMemoryChatApi::new(ME);
        seed(&api, 3);
        api.set_stalled(true);
        let fetcher = fetcher(api.clone());

        let result = fetcher.poll().await;
        assert!(matches!(result, Err(ApiError::Timeout(d)) if d == Duration::from_secs(10)));
        let result = fetcher.mark_read(MessageId::new(3)).await;
        assert!(matches!(result, Err(ApiError::Timeout(_))));
        assert!(api.read_calls().is_empty());

        api.set_stalled(false);
        assert_eq!(fetcher.poll().await.unwrap().messages.len(), 3);
    }

    #[tokio::test]
    async fn backend_failure_propagates() {
        let api = InMemoryChatApi::new(ME);
        api.set_failing(true);
        let result = fetcher(api).poll().await;
        assert!(matches!(result, Err(ApiError::Status { status: 503 })));
    }
}
