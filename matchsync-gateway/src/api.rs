//! History and read-receipt HTTP endpoints.
//!
//! `GET /messages/{other}?limit=N[&beforeId=M]` returns a [`HistoryPage`]
//! whose `messages` is `null` when the users never talked.
//! `POST /messages/read` takes a [`MarkReadRequest`]. The caller names
//! itself in the `x-user-id` header; requests without it get 401.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;

use matchsync_proto::message::{HistoryPage, MarkReadRequest, MessageId, UserId};

use crate::gateway::GatewayState;

/// Header naming the requesting user.
pub const USER_HEADER: &str = "x-user-id";

/// Page size when the request does not give one.
const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub before_id: Option<i64>,
}

fn caller(headers: &HeaderMap) -> Result<UserId, StatusCode> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(UserId::new)
        .ok_or(StatusCode::UNAUTHORIZED)
}

/// `GET /messages/{other}`
///
/// # Errors
///
/// `401` without a valid `x-user-id` header.
pub async fn history(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(other): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, StatusCode> {
    let me = caller(&headers)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIMIT)
        .min(state.max_page_size())
        .max(1);
    let before = query.before_id.map(MessageId::new);

    let messages = state
        .store
        .history(me, UserId::new(other), limit, before)
        .await;
    tracing::debug!(
        me = %me,
        other,
        limit,
        count = messages.as_ref().map_or(0, Vec::len),
        "history served"
    );
    Ok(Json(HistoryPage { messages }))
}

/// `POST /messages/read`
///
/// # Errors
///
/// `401` without a valid `x-user-id` header.
pub async fn mark_read(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<MarkReadRequest>,
) -> Result<StatusCode, StatusCode> {
    let me = caller(&headers)?;
    let changed = state
        .store
        .mark_read(me, request.sender_id, request.last_read_message_id)
        .await;
    tracing::debug!(
        reader = %me,
        sender = %request.sender_id,
        last_read = %request.last_read_message_id,
        changed,
        "read receipt applied"
    );
    Ok(StatusCode::NO_CONTENT)
}
