//! IPC bridge between a parent and its execution contexts.
//!
//! # Architecture
//!
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **protocol**: wire types (Frame, JobPacket, Bootstrap)
//! - **channel**: ordered bidirectional channel over a framed stream

pub mod channel;
pub mod codec;
pub mod protocol;

pub use channel::{BoxReader, BoxWriter, Channel, ChannelError, SerializationError, pair};
