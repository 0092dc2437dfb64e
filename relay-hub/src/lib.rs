//! Text and file relay hub for named peers.
//!
//! Peers connect over TCP, register a unique name, and then exchange direct
//! or broadcast messages and stream files through the hub. The protocol is
//! newline-delimited JSON control frames, with raw file bodies following
//! `file` headers on the same stream.
//!
//! - [`cli`] parses the command-line interface into a [`server::RelayConfig`].
//! - [`server`] accepts TCP connections and spawns one session per client.
//! - [`session`] drives registration, frame dispatch, and teardown for one
//!   connection, plus the writer task that owns its outbound stream.
//! - [`registry`] is the shared name-to-outbound-path map.
//! - [`router`] resolves direct and broadcast destinations and evicts peers
//!   whose outbound path fails.
//! - [`relay`] streams file bodies between sessions in bounded chunks.
//! - [`message`] provides the JSON line protocol plus helpers for async
//!   reads and writes.
//! - [`error`] holds the typed failures shared across modules.

pub mod cli;
pub mod error;
pub mod message;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;
