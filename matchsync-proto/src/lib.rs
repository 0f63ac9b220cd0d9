//! Shared protocol definitions for the `MatchSync` wire format.

pub mod codec;
pub mod gateway;
pub mod message;
