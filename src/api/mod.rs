//! Runtime protocol over HTTP
//!
//! [`RuntimeRouter`] exposes any [`Runtime`](crate::domain::ports::Runtime)
//! as a REST API; [`RemoteRuntime`] is the matching client and implements
//! the same port, so a poollet cannot tell a local broker from a remote one.

pub mod client;
pub mod server;

pub use client::RemoteRuntime;
pub use server::{serve, ApiErrorResponse, ApiServerConfig, RuntimeRouter};
