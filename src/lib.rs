//! Event core for an authenticated, encrypted layer-2 tunnel server.
//!
//! This crate owns the parts of the server that are independent of any
//! particular security mechanism or packet-transport setup: the readiness-driven
//! event loop, the per-client state machine, the connection table, the netinit
//! pipeline, and the timeout/rekey scheduler. It does not open sockets, parse
//! argv, daemonize, or speak GSSAPI itself — those are the job of a thin
//! launcher binary that constructs a [`Server`] from an already-open UDP
//! socket, an already-configured tap device file descriptor, and an
//! [`Authenticator`] implementation, then calls [`Server::run`].
//!
//! # Wiring contract
//!
//! The launcher is responsible for, in order:
//!
//! 1. Parsing command-line flags into a [`ServerConfig`] (see [`config`]).
//! 2. Opening and configuring the tap device (`TUNSETIFF` and friends) and
//!    passing its raw file descriptor to [`Server::new`].
//! 3. Binding the UDP socket the tunnel listens on.
//! 4. Providing a concrete [`Authenticator`] — in production, a binding over
//!    a real GSSAPI library; in tests, [`auth::testing::MockAuthenticator`].
//! 5. Installing a `slog::Logger` (this crate never constructs its own
//!    drain; see the [`config`] module docs for the expected setup).
//!
//! Everything after that point — demultiplexing datagrams to connections,
//! negotiating and rekeying security contexts, running the netinit helper,
//! bridging Ethernet frames between the tap device and the tunnel, and
//! handling `SIGTERM`/`SIGQUIT` — is this crate's job.

pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
mod dispatch;
mod io;
pub mod mac;
mod netinit;
pub mod error;
#[cfg(test)]
mod scenarios;
mod server;
mod table;
mod timer;

pub use auth::{AcceptError, AcceptOutcome, Authenticator, TimeRemaining, WrapOutcome};
pub use config::{Flags, ServerConfig};
pub use error::{NetinitError, StartupError};
pub use server::Server;
pub use table::ConnectionHandle;
