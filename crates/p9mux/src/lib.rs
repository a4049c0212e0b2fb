#![forbid(unsafe_code)]
//! Asynchronous multiplexing 9P2000 client library for Rust.
//!
//! Many tasks share one connection to a 9P file server. Each request is
//! stamped with a tag from a bounded pool, handed to a dispatcher task which
//! writes it and records it as outstanding, and answered when a response
//! carrying the same tag comes back. Responses may arrive in any order.
//!
//! # Example
//!
//! ```no_run
//! use p9mux::{Client, Config, Context, Session, Result, P92000, NOFID};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::dial("tcp!127.0.0.1!564", Config::default()).await?;
//!     let ctx = Context::background();
//!
//!     let (msize, version) = client.version(&ctx, client.msize(), P92000).await?;
//!     println!("{} with msize {}", version, msize);
//!
//!     let root = client.attach(&ctx, 0, NOFID, "glenda", "").await?;
//!     println!("root {:?}", root);
//!
//!     client.clunk(&ctx, 0).await?;
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Cancellation
//!
//! Every request carries a [`Context`]. A caller whose context is cancelled
//! or runs past its deadline gets [`Error::Cancelled`] or
//! [`Error::DeadlineExceeded`] without disturbing other callers. Its tag stays
//! reserved, and a `TFlush` is sent for it, until the server is done with it.
//!
//! # Faults
//!
//! Trouble that belongs to no single caller, such as a response for a tag
//! nobody is waiting on or a broken connection, is published on
//! [`Client::faults`]. A broken connection also closes the client: every
//! waiting request fails with [`Error::Closed`].
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!127.0.0.1!564"`)
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/socket!0"`)
//! - anything else implementing `AsyncRead` and `AsyncWrite`, through [`Client::new`]
pub mod client;
pub mod config;
pub mod context;
mod dispatch;
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod session;
pub mod tag;
#[macro_use]
pub mod utils;

#[cfg(test)]
mod testing;

pub use crate::client::Client;
pub use crate::config::Config;
pub use crate::context::Context;
pub use crate::error::errno;
pub use crate::error::{Error, Fault};
pub use crate::fcall::*;
pub use crate::session::Session;
pub use crate::utils::Result;
