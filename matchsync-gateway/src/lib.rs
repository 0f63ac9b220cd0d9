//! Development gateway for `MatchSync`.
//!
//! Serves the realtime WebSocket (`/ws?userId=N`) and the history API
//! (`/messages/...`) from one in-memory store, so the sync engine can be
//! exercised end to end without the production backend.

pub mod api;
pub mod config;
pub mod gateway;
pub mod store;
