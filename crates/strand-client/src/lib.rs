//! Client SDK for the Strand RPC framework.
//!
//! This crate provides client-side components:
//! - Client builder and connection management
//! - Callback-based `invoke` with per-call options
//! - Unary (`call`) and streaming (`stream`) conveniences

pub mod client;
pub mod streaming;

pub use client::{CallOptions, Client, ClientBuilder, ClientConfig};
pub use streaming::CallStream;
