//! Linda-style tuple space served over a line-oriented TCP protocol.
//!
//! Clients coordinate by writing values under keys, reading or taking them
//! (waiting until one exists), and asking the server to transform a value
//! with a named service. Each module has one job:
//!
//! - [`service`] holds the fixed table of text transformations used by `EX`.
//! - [`waiters`] tracks tasks parked until a key receives a value.
//! - [`space`] is the shared store and its blocking operations.
//! - [`protocol`] parses command lines and renders replies.
//! - [`server`] accepts connections and runs one session task per client.
//! - [`client`] is a small interactive client for the same protocol.
//! - [`cli`] parses the command-line interface for both modes.

pub mod cli;
pub mod client;
pub mod protocol;
pub mod server;
pub mod service;
pub mod space;
pub mod waiters;
