//! Server-wide configuration. Logging is deliberately not configured here:
//! like the teacher's own `Endpoint`, this crate takes a `slog::Logger`
//! (see [`crate::Server::new`]) built by whatever drain the launcher wants —
//! terminal output during development, a syslog drain in production — and
//! only ever creates child loggers from it.

use std::path::PathBuf;

/// Boolean switches that gate optional server behavior.
///
/// Each field is independent: the original C implementation's option parser let
/// `-u` fall through into `-t`, and `-t` into `-d`. That fallthrough was never
/// documented as intentional, so it is not reproduced here (see DESIGN.md).
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    pub verbose: bool,
    pub kill_on_timeout: bool,
    pub daemonize: bool,
}

/// Server-wide tunables, filled in by the launcher after it has parsed argv,
/// opened the tap device, and opened the UDP socket. None of those three are
/// this crate's concern; `ServerConfig` only carries what the event core needs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host-based service principal name passed to `acquire_server_credentials`.
    pub service_name: String,
    /// Path to the optional netinit helper. `None` means netinit always
    /// succeeds immediately with an empty reply (§4.4).
    pub netinit_helper: Option<PathBuf>,
    pub flags: Flags,
}

impl ServerConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        ServerConfig {
            service_name: service_name.into(),
            netinit_helper: None,
            flags: Flags::default(),
        }
    }
}
