//! Single-topic TCP publish/subscribe broker.
//!
//! Clients connect, send one JSON handshake frame naming their role
//! (`{"ClientType": "PUBLISHER"}` or `{"ClientType": "SUBSCRIBER"}`) and wait
//! for the literal reply `OK`. From then on every byte a publisher writes is
//! copied, unframed, to every subscriber connected at that moment.
//!
//! - [`cli`] parses the command-line interface for broker and client modes.
//! - [`config`] turns broker flags into runtime settings.
//! - [`handshake`] reads, classifies and acknowledges the handshake frame, and
//!   provides the client half of the exchange.
//! - [`connection`] wraps the shared write half of an admitted socket with
//!   idempotent close.
//! - [`registry`] tracks admitted connections by topic and role.
//! - [`fanout`] runs the per-publisher read loops and the fan-out passes.
//! - [`broker`] accepts sockets and drives each one through its lifecycle.
//! - [`client`] holds the timestamp publisher and the printing subscriber.

pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod handshake;
pub mod registry;
