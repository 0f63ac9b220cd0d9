//! [`ChatApi`] over HTTP.
//!
//! `GET {base}/messages/{other}?limit=N[&beforeId=M]` answers with
//! `{"messages": [...] | null}`; `POST {base}/messages/read` takes a
//! [`MarkReadRequest`]. Every request carries the local user in the
//! `x-user-id` header and, when configured, a bearer token.

use reqwest::{Client, RequestBuilder};
use url::Url;

use matchsync_proto::message::{HistoryMessage, HistoryPage, MarkReadRequest, MessageId, UserId};

use super::{ApiError, ChatApi};
use crate::config::EndpointConfig;

/// Header naming the requesting user.
const USER_HEADER: &str = "x-user-id";

/// REST client for the messaging backend.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: Client,
    base: Url,
    me: UserId,
    auth_token: Option<String>,
}

impl HttpChatApi {
    /// Client for `base_url` acting as `me`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Request`] if `base_url` is not a valid base URL.
    pub fn new(base_url: &str, me: UserId, auth_token: Option<String>) -> Result<Self, ApiError> {
        let mut base = Url::parse(base_url).map_err(|e| ApiError::Request(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::Request(format!("{base_url} cannot be a base url")));
        }
        // Url::join drops the last segment unless the path ends with a slash.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client: Client::new(),
            base,
            me,
            auth_token,
        })
    }

    /// Client for the configured backend, carrying its auth token.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotConfigured`] without an API base URL, otherwise
    /// whatever [`new`](Self::new) returns.
    pub fn from_endpoints(endpoints: &EndpointConfig, me: UserId) -> Result<Self, ApiError> {
        let base = endpoints
            .api_base_url
            .as_deref()
            .ok_or(ApiError::NotConfigured)?;
        Self::new(base, me, endpoints.auth_token.clone())
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::Request(e.to_string()))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(USER_HEADER, self.me.to_string());
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn request_error(e: &reqwest::Error) -> ApiError {
    e.status().map_or_else(
        || ApiError::Request(e.to_string()),
        |status| ApiError::Status {
            status: status.as_u16(),
        },
    )
}

impl ChatApi for HttpChatApi {
    async fn fetch_history(
        &self,
        other: UserId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Option<Vec<HistoryMessage>>, ApiError> {
        let mut url = self.endpoint(&format!("messages/{other}"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(before) = before {
                query.append_pair("beforeId", &before.to_string());
            }
        }

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| request_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%other, status = status.as_u16(), "history request rejected");
            return Err(ApiError::Status {
                status: status.as_u16(),
            });
        }

        let page: HistoryPage = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(page.messages)
    }

    async fn mark_read(&self, sender: UserId, last_read: MessageId) -> Result<(), ApiError> {
        let url = self.endpoint("messages/read")?;
        let body = MarkReadRequest {
            sender_id: sender,
            last_read_message_id: last_read,
        };

        let response = self
            .authorize(self.client.post(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%sender, %last_read, status = status.as_u16(), "read receipt rejected");
            return Err(ApiError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
