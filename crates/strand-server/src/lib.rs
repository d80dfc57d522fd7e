//! Server SDK for the Strand RPC framework.
//!
//! This crate provides server-side components:
//! - Method router with raw, unary and streaming handlers
//! - Reply handle enforcing the call/reply vocabulary
//! - Server runtime dispatching each inbound call on its own channel

pub mod responder;
pub mod router;
pub mod server;
pub mod streaming;

pub use responder::{Reply, Responder};
pub use router::{HandlerFn, MethodRouter, INSPECT, LEGACY_INSPECT};
pub use server::{Server, ServerBuilder, ServerConfig};
pub use streaming::{CallResponse, ReplyStream};
