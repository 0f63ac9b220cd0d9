//! `MatchSync`: realtime chat synchronization engine.
//!
//! Keeps one two-party conversation consistent across a shared push
//! connection, periodic history polls and optimistic local sends.

pub mod chat;
pub mod config;
pub mod connection;
pub mod history;
pub mod lifecycle;
pub mod session;
pub mod transport;
