//! The `Server`: owns the `mio::Poll`, the two shared descriptors, the
//! connection table, the authenticator, and the timer queue. Generalizes
//! the teacher's `Endpoint` (which owns `Context`, the slab and the
//! indexes) to also own the reactor and the real file descriptors, since
//! unlike `quinn-proto` this protocol is not sans-IO (§9 design notes).

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::{SIGQUIT, SIGTERM};
use signal_hook_mio::v0_8::Signals;
use slog::Logger;

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::error::StartupError;
use crate::io::TapDevice;
use crate::table::ConnectionTable;
use crate::timer::TimerScheduler;

pub(crate) const TOKEN_UDP: Token = Token(0);
pub(crate) const TOKEN_TAP: Token = Token(1);
pub(crate) const TOKEN_SIGNALS: Token = Token(2);
/// Per-connection netinit pipe tokens start here; `Token(NETINIT_TOKEN_BASE + handle.0)`
/// is unique as long as a connection's slab index fits below this offset from
/// the next one, which holds since indexes are reused only after a connection
/// (and its netinit registration) has already been torn down.
pub(crate) const NETINIT_TOKEN_BASE: usize = 16;

/// Process-wide state (§3 "Global state") plus the reactor. One `Server`
/// per process; there is no reason for more than one UDP socket or tap
/// device to exist in this design.
pub struct Server<A: Authenticator> {
    pub(crate) poll: Poll,
    pub(crate) udp: UdpSocket,
    pub(crate) tap: TapDevice,
    pub(crate) signals: Signals,
    pub(crate) table: ConnectionTable<A::Context>,
    pub(crate) authenticator: A,
    pub(crate) config: ServerConfig,
    pub(crate) timers: TimerScheduler,
    pub(crate) log: Logger,
    shutting_down: bool,
}

impl<A: Authenticator> Server<A> {
    /// `udp` and `tap_fd` are opened by the external launcher (§1); this
    /// acquires credentials (the one fatal startup step this crate owns)
    /// and registers both descriptors plus the termination signals with a
    /// fresh `mio::Poll`.
    pub fn new(
        mut authenticator: A,
        config: ServerConfig,
        mut udp: UdpSocket,
        tap_fd: RawFd,
        log: Logger,
    ) -> Result<Self, StartupError> {
        authenticator
            .acquire_server_credentials(&config.service_name)
            .map_err(|_| StartupError::CredentialAcquisition(config.service_name.clone()))?;
        slog::info!(log, "acquired server credentials"; "service" => %config.service_name);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut udp, TOKEN_UDP, Interest::READABLE)?;
        let mut tap = TapDevice::from_raw_fd(tap_fd);
        poll.registry()
            .register(&mut tap, TOKEN_TAP, Interest::READABLE)?;
        let mut signals = Signals::new([SIGTERM, SIGQUIT])?;
        poll.registry()
            .register(&mut signals, TOKEN_SIGNALS, Interest::READABLE)?;

        Ok(Server {
            poll,
            udp,
            tap,
            signals,
            table: ConnectionTable::new(),
            authenticator,
            config,
            timers: TimerScheduler::new(),
            log,
            shutting_down: false,
        })
    }

    /// Drive the event loop until the supervisor (§4.8) breaks it. One
    /// `poll` call per iteration; readiness dispatch is strictly
    /// single-threaded and cooperative (§5).
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(128);
        while !self.shutting_down {
            let timeout = self.timers.next_timeout().or(Some(Duration::from_secs(60)));
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    TOKEN_UDP => self.on_udp_readable()?,
                    TOKEN_TAP => self.on_tap_readable()?,
                    TOKEN_SIGNALS => self.on_signals_readable(),
                    token => self.on_netinit_readable(token),
                }
            }

            self.run_expired_timers();
            self.run_netinit_child_reaps();
        }
        Ok(())
    }

    pub(crate) fn begin_shutdown(&mut self) {
        self.shutting_down = true;
    }
}

#[cfg(test)]
impl<A: Authenticator> Server<A> {
    /// Skips credential acquisition so the end-to-end harness can wire up
    /// already-open loopback/test descriptors without a real GSSAPI
    /// environment. Registration is otherwise identical to `new`.
    pub(crate) fn new_for_test(
        authenticator: A,
        config: ServerConfig,
        mut udp: UdpSocket,
        tap_fd: RawFd,
        log: Logger,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut udp, TOKEN_UDP, Interest::READABLE)?;
        let mut tap = TapDevice::from_raw_fd(tap_fd);
        poll.registry()
            .register(&mut tap, TOKEN_TAP, Interest::READABLE)?;
        let mut signals = Signals::new([SIGTERM, SIGQUIT])?;
        poll.registry()
            .register(&mut signals, TOKEN_SIGNALS, Interest::READABLE)?;

        Ok(Server {
            poll,
            udp,
            tap,
            signals,
            table: ConnectionTable::new(),
            authenticator,
            config,
            timers: TimerScheduler::new(),
            log,
            shutting_down: false,
        })
    }
}
