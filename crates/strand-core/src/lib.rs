//! Core types for the Strand multiplexed RPC protocol.
//!
//! This crate provides the foundation types used across all Strand components:
//! - Wire events and their msgpack encoding
//! - Channel buffers for windowed flow control
//! - Message id generation
//! - Multi-frame framing for stream transports
//! - The error taxonomy

pub mod buffer;
pub mod error;
pub mod event;
pub mod framing;
pub mod id;

pub use buffer::{ChannelBuffer, DEFAULT_REMOTE_CAPACITY, DEFAULT_WINDOW};
pub use error::{RemoteError, StrandError};
pub use event::{Event, Header, PROTOCOL_VERSION};
pub use framing::{encode_message, FrameError, MessageParser};
pub use id::IdGenerator;
pub use rmpv::Value;
