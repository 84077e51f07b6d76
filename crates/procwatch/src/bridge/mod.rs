//! Channel bridge between clients and the coordinator.
//!
//! # Architecture
//!
//! - **protocol**: Request kinds, header layout and payload types
//! - **codec**: Header + payload framing for AsyncRead/AsyncWrite
//! - **transport**: Named channel binding, connecting and cleanup

pub mod codec;
pub mod protocol;
pub mod transport;
