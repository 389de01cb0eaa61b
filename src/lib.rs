//! Depot library
//!
//! Sandboxed remote file storage over a hand-rolled framed TCP protocol:
//! a single-threaded reactor serves PUT/GET/DEL/LST against a contained
//! directory tree, and a blocking client drives the same frame codec.

pub mod cli;
pub mod client;
pub mod frame;
pub mod listing;
pub mod protocol;
pub mod sandbox;
pub mod server;
