use std::io;

use failure::Fail;

/// Fatal startup failures. The caller logs and exits non-zero (§7).
#[derive(Debug, Fail)]
pub enum StartupError {
    #[fail(display = "failed to acquire server credentials for {}", _0)]
    CredentialAcquisition(String),
    #[fail(display = "failed to register socket with the event loop: {}", _0)]
    Poll(io::Error),
}

impl From<io::Error> for StartupError {
    fn from(e: io::Error) -> Self {
        StartupError::Poll(e)
    }
}

/// Per-connection fatal failures during the netinit pipeline (§4.4, §7).
/// Recovered locally: the connection is sent `SHUTDOWN` and destroyed.
#[derive(Debug, Fail)]
pub enum NetinitError {
    #[fail(display = "failed to create pipe: {}", _0)]
    Pipe(io::Error),
    #[fail(display = "failed to spawn netinit helper: {}", _0)]
    Spawn(io::Error),
}

impl From<io::Error> for NetinitError {
    fn from(e: io::Error) -> Self {
        NetinitError::Spawn(e)
    }
}
