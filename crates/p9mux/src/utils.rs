use crate::error;

use std::io;

use tokio_util::codec::length_delimited::{self, LengthDelimitedCodec};

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split `proto!address!port` into its three parts
pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    Some((proto, addr, port))
}

/// 9P framing: size[4] little endian, counting the size field itself
pub fn framing(max_frame_length: usize) -> length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .max_frame_length(max_frame_length)
        .little_endian();
    builder
}

/// Errors which only mean "try again": a deadline expired or the call was interrupted
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[test]
fn parse_proto_splits_on_bang() {
    assert_eq!(
        parse_proto("tcp!127.0.0.1!564"),
        Some(("tcp", "127.0.0.1", "564"))
    );
    assert_eq!(
        parse_proto("unix!/tmp/9p.sock!0"),
        Some(("unix", "/tmp/9p.sock", "0"))
    );
    assert_eq!(parse_proto("tcp!localhost"), None);
}

#[test]
fn timeouts_are_transient() {
    assert!(is_transient(&io_err!(TimedOut, "deadline")));
    assert!(!is_transient(&io_err!(ConnectionReset, "reset")));
    assert!(!is_transient(&io_err!(UnexpectedEof, "eof")));
}
