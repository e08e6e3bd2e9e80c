//! Load generator for streaming chat-completion endpoints.
//!
//! Virtual users issue paced `stream: true` requests, consume the SSE reply
//! line by line and report every attempt as one of `chat_total`,
//! `chat_total_violation` or `chat_stream_error`, plus a `chat_first_token`
//! event when the first line arrives.

pub mod classifier;
pub mod config;
pub mod corpus;
pub mod error;
pub mod host;
pub mod metrics;
pub mod request;
pub mod stream;
pub mod user;
