//! Error types of the client.

use std::{io, sync::Arc};

use thiserror::Error;

use crate::fcall::MsgType;

/// Errno values carried by `RlError` replies of Linux-dialect servers
pub mod errno {
    pub use nix::errno::Errno;
    pub use nix::errno::Errno::*;
}

/// Error returned to a single caller.
///
/// Timeouts and cancellations only ever concern the caller that sees them.
/// `Closed` means the whole client is gone; why it went is reported as a
/// [`Fault`].
#[derive(Debug, Error)]
pub enum Error {
    /// The client has shut down, or shut down while the request was in flight
    #[error("client is closed")]
    Closed,

    /// The caller's context was cancelled
    #[error("context cancelled")]
    Cancelled,

    /// The caller's context deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The request could not be placed on the wire
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    /// The peer violated the protocol for this request
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The reply was well formed but of the wrong kind
    #[error("unexpected response: expected {expected:?}, got {got:?}")]
    UnexpectedResponse { expected: MsgType, got: MsgType },

    /// Transport failure
    #[error("{0}")]
    Io(#[from] io::Error),

    /// `RError` reply
    #[error("{0}")]
    Remote(String),

    /// `RlError` reply
    #[error("{0}")]
    No(#[from] errno::Errno),

    /// `try_acquire` found every tag checked out
    #[error("tag pool exhausted")]
    PoolExhausted,

    /// A tag was released which was not checked out
    #[error("tag {0} is not checked out")]
    TagNotOutstanding(u16),
}

/// A client-level problem not attributable to a single caller.
///
/// Published on the broadcast channel returned by
/// [`Client::faults`](crate::client::Client::faults).
#[derive(Clone, Debug, Error)]
pub enum Fault {
    /// A response arrived for a tag with no outstanding request
    #[error("response {typ:?} for unknown tag {tag}")]
    UnexpectedResponse { tag: u16, typ: MsgType },

    /// The connection failed; the client has been closed
    #[error("transport failure: {0}")]
    Transport(Arc<io::Error>),
}

#[test]
fn display_reads_like_a_sentence() {
    let e = Error::UnexpectedResponse {
        expected: MsgType::RVersion,
        got: MsgType::RAttach,
    };
    assert_eq!(
        e.to_string(),
        "unexpected response: expected RVersion, got RAttach"
    );
    assert_eq!(Error::No(errno::ENOENT).to_string(), errno::ENOENT.to_string());
}
