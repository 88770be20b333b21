//! A client for the `GBXRemote 2` protocol: the length-framed XML-RPC
//! transport of TrackMania and ManiaPlanet dedicated servers.
//!
//! `GbxClient` opens a persistent TCP connection, verifies the
//! protocol handshake, and multiplexes caller-initiated requests with
//! the method calls the server pushes on the same socket. Responses
//! are matched back to their callers by the 32-bit handle written
//! into each frame; server-pushed calls are forwarded to the `Host`
//! the client was created with.

pub use client::*;
pub use error::*;
pub use xml::{from_value, Call, Fault, Response, Value};

mod client;
mod error;
mod frame;
mod xml;

/// Builds a `Vec<Value>` from anything a `Value` converts from.
///
/// ```
/// use gbxremote::args;
///
/// let args = args!["tim", 248, false];
/// ```
#[macro_export]
macro_rules! args {
    ( $( $args:expr ),* $(,)?) => {
        vec![$( $crate::Value::from($args) ),*]
    };
}
