//! Unix-socket RPC surface (spec.md §4.7): wire protocol, the
//! connection-handling server loop, and client-side helpers for issuing
//! requests from the CLI.

pub mod client;
pub mod protocol;
pub mod server;

pub use protocol::{codec, DaemonStatus, FilterParams, Request, Response};
pub use server::serve;
