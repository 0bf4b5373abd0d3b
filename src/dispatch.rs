//! The frame dispatcher (§4.5, tap → network) and the packet dispatcher
//! (§4.6, network → ...), plus the shared rekey and destroy paths that both
//! of them — and the timer scheduler — drive into.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use mio::unix::SourceFd;
use mio::{Interest, Token};
use slog::{debug, o, trace, warn};

use crate::auth::{AcceptOutcome, Authenticator, TimeRemaining, WrapOutcome};
use crate::codec::{self, Packet, PacketKind};
use crate::connection::{Connection, GssState};
use crate::io::MAX_FRAME_LEN;
use crate::mac::MacAddr;
use crate::netinit::NetinitState;
use crate::server::{Server, NETINIT_TOKEN_BASE};
use crate::table::ConnectionHandle;

impl<A: Authenticator> Server<A> {
    fn netinit_token(handle: ConnectionHandle) -> Token {
        Token(NETINIT_TOKEN_BASE + handle.0)
    }

    fn handle_from_netinit_token(token: Token) -> ConnectionHandle {
        ConnectionHandle(token.0 - NETINIT_TOKEN_BASE)
    }

    /// Frame a packet and put it on the wire. `payload` is already final
    /// wire bytes (wrapped if the kind requires it); callers decide that.
    fn send_packet(&mut self, handle: ConnectionHandle, kind: PacketKind, payload: Option<&[u8]>) {
        let (peer, session_id) = match self.table.get(handle) {
            Some(conn) => (conn.peer, conn.session_id),
            None => return,
        };
        let datagram = codec::encode(kind, session_id, payload);
        if let Err(e) = self.udp.send_to(&datagram, SocketAddr::V4(peer)) {
            warn!(self.log, "send_to failed"; "peer" => %peer, "error" => %e);
        }
    }

    /// §4.1/§4.3 "any | wrap/unwrap returns rekey_needed": discard the
    /// context and nudge the peer back to `Fresh`.
    fn rekey(&mut self, handle: ConnectionHandle) {
        if let Some(conn) = self.table.get_mut(handle) {
            if let Some(ctx) = conn.context.take() {
                self.authenticator.delete(ctx);
            }
            conn.gss_state = GssState::Fresh;
            conn.principal_name = None;
        }
        self.timers.cancel(handle);
        debug!(self.log, "rekeying connection"; "handle" => handle.0);
        self.send_packet(handle, PacketKind::GssInit, None);
    }

    /// §3 destruction order: unlink from both indexes, cancel watchers and
    /// timers, delete the context, free the netinit buffer, release names.
    fn destroy_connection(&mut self, handle: ConnectionHandle) {
        if let Some(conn) = self.table.get_mut(handle) {
            if let Some(ctx) = conn.context.take() {
                self.authenticator.delete(ctx);
            }
            if let Some(mut netinit) = conn.netinit.take() {
                let fd = netinit.pipe_read_fd;
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                let _ = netinit.child.kill();
                let _ = netinit.child.wait();
            }
        }
        self.timers.remove(handle);
        self.table.destroy(handle);
        debug!(self.log, "destroyed connection"; "handle" => handle.0);
    }

    // ---- packet dispatcher (§4.6) ----

    pub(crate) fn on_udp_readable(&mut self) -> io::Result<()> {
        let mut buf = [0u8; MAX_FRAME_LEN + 64];
        loop {
            match self.udp.recv_from(&mut buf) {
                Ok((n, SocketAddr::V4(peer))) => self.handle_datagram(&buf[..n], peer),
                Ok((_, SocketAddr::V6(_))) => {
                    // IPv4-only transport (§1 non-goals); nothing to do.
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8], peer: std::net::SocketAddrV4) {
        let (packet, peer) = match codec::decode(datagram, peer) {
            Ok(p) => p,
            Err(codec::DecodeError::RekeyNeeded(session_id)) => {
                // §4.6: "On rekey_needed: find the connection, delete its
                // context, send GSSINIT(empty)." No connection is created if
                // one doesn't already exist for this (peer, session_id).
                if let Some(handle) = self.table.find_by_peer(peer, session_id) {
                    self.rekey(handle);
                }
                return;
            }
            Err(e) => {
                trace!(self.log, "dropping undecodable datagram"; "reason" => %e);
                return;
            }
        };
        let log = self.log.clone();
        let (handle, _created) = self.table.get_or_create(peer, packet.session_id, |p, s| {
            Connection::fresh(p, s).with_logger(log.new(o!("peer" => p.to_string(), "session" => s)))
        });
        if let Some(conn) = self.table.get_mut(handle) {
            conn.reconcile_peer(peer);
        }
        self.dispatch_packet(handle, packet);
    }

    /// §4.3's table only spells out `GSSINIT` handling for `Fresh`/
    /// `Handshaking`; every other kind falls under "recv any other kind ->
    /// reply GSSINIT(empty)" while the connection isn't yet `Established`.
    /// `DATA`'s further `mac == 0` silent-drop case is nested inside
    /// `on_data`, reached only once this gate has already passed.
    fn dispatch_packet(&mut self, handle: ConnectionHandle, packet: Packet) {
        if packet.kind == PacketKind::GssInit {
            return self.on_gssinit(handle, &packet.payload);
        }
        let established = self
            .table
            .get(handle)
            .map_or(false, |c| c.gss_state.is_established());
        if !established {
            self.send_packet(handle, PacketKind::GssInit, None);
            return;
        }
        match packet.kind {
            PacketKind::Data => self.on_data(handle, &packet.payload),
            PacketKind::NetInit => self.on_netinit(handle, &packet.payload),
            PacketKind::Shutdown => self.destroy_connection(handle),
            PacketKind::Echo => self.send_packet(handle, PacketKind::Echo, None),
            // Server-to-client only; a client sending one is simply ignored (§6).
            PacketKind::NetStart => {}
            PacketKind::GssInit => unreachable!("handled above"),
        }
    }

    fn on_gssinit(&mut self, handle: ConnectionHandle, token: &[u8]) {
        let context = match self.table.get_mut(handle) {
            Some(conn) => conn.context.take(),
            None => return,
        };
        let was_established = context.is_some()
            && self
                .table
                .get(handle)
                .map_or(false, |c| c.gss_state.is_established());
        if was_established {
            // A client restarting its handshake against an already-established
            // connection (e.g. after its own restart) gets treated the same as
            // an explicit rekey: drop the stale context and start fresh.
            if let Some(ctx) = context {
                self.authenticator.delete(ctx);
            }
            self.timers.cancel(handle);
            if let Some(conn) = self.table.get_mut(handle) {
                conn.gss_state = GssState::Fresh;
                conn.principal_name = None;
            }
            return self.on_gssinit(handle, token);
        }

        match self.authenticator.accept(context, token) {
            Ok(AcceptOutcome::Continue { context, out_token }) => {
                if let Some(conn) = self.table.get_mut(handle) {
                    conn.context = Some(context);
                    conn.gss_state = GssState::Handshaking;
                }
                self.send_packet(handle, PacketKind::GssInit, Some(&out_token));
            }
            Ok(AcceptOutcome::Complete {
                context,
                out_token,
                peer_name,
                remaining,
            }) => {
                let mac_is_zero = self
                    .table
                    .get(handle)
                    .map_or(true, |c| c.mac.is_zero());
                if let Some(conn) = self.table.get_mut(handle) {
                    conn.context = Some(context);
                    conn.gss_state = GssState::Established;
                    conn.principal_name = Some(peer_name.clone());
                }
                debug!(self.log, "context established"; "principal" => %peer_name);
                if let Some(token) = out_token {
                    self.send_packet(handle, PacketKind::GssInit, Some(&token));
                }
                if let Some(seconds) = remaining {
                    self.timers.arm(handle, seconds);
                }
                if mac_is_zero {
                    self.send_packet(handle, PacketKind::NetStart, None);
                }
            }
            Err(_) => {
                warn!(self.log, "security context negotiation failed");
                self.send_packet(handle, PacketKind::Shutdown, None);
                self.destroy_connection(handle);
            }
        }
    }

    /// Reached only once `dispatch_packet` has confirmed `Established`; the
    /// remaining tie-break is `mac == 0`, silently dropped without a nudge
    /// (§4.3: "the client has authenticated but not yet run netinit").
    fn on_data(&mut self, handle: ConnectionHandle, ciphertext: &[u8]) {
        let mac_zero = match self.table.get(handle) {
            Some(conn) => conn.mac.is_zero(),
            None => return,
        };
        if mac_zero {
            // Authenticated but hasn't run netinit yet; drop without a nudge (§4.3).
            return;
        }
        let mut context = match self.table.get_mut(handle) {
            Some(conn) => match conn.context.take() {
                Some(c) => c,
                None => return,
            },
            None => return,
        };
        let verdict = self.authenticator.unwrap(&mut context, ciphertext);
        if let Some(conn) = self.table.get_mut(handle) {
            conn.context = Some(context);
        }
        match verdict {
            WrapOutcome::Ok(plaintext) => {
                if let Err(e) = self.tap.write_frame(&plaintext) {
                    warn!(self.log, "tap write failed"; "error" => %e);
                }
            }
            WrapOutcome::RekeyNeeded => self.rekey(handle),
            WrapOutcome::Error => {
                warn!(self.log, "unwrap failed, dropping datagram"; "handle" => handle.0);
            }
        }
    }

    fn on_netinit(&mut self, handle: ConnectionHandle, payload: &[u8]) {
        if self
            .table
            .get(handle)
            .map_or(true, |c| c.netinit.is_some())
        {
            // Already running, or connection gone (§4.3: a second NETINIT is ignored).
            return;
        }
        if payload.len() < 6 {
            return;
        }
        let mac = MacAddr::from_slice(&payload[..6]).unwrap();
        self.table.relearn_mac(handle, mac);

        let helper = self.config.netinit_helper.clone();
        let helper = match helper {
            None => {
                self.send_packet(handle, PacketKind::NetInit, None);
                return;
            }
            Some(h) => h,
        };

        let (principal, peer_ip, peer_port) = match self.table.get(handle) {
            Some(conn) => (
                conn.principal_name.clone().unwrap_or_default(),
                conn.peer.ip().to_string(),
                conn.peer.port(),
            ),
            None => return,
        };

        let udp_fd = self.udp.as_raw_fd();
        let tap_fd = self.tap.raw_fd();
        match NetinitState::spawn(&helper, &principal, &peer_ip, peer_port, udp_fd, tap_fd) {
            Ok(mut state) => {
                let fd = state.pipe_read_fd;
                let token = Self::netinit_token(handle);
                if let Err(e) =
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), token, Interest::READABLE)
                {
                    warn!(self.log, "failed to register netinit pipe"; "error" => %e);
                    let _ = state.child.kill();
                    let _ = state.child.wait();
                    self.send_packet(handle, PacketKind::Shutdown, None);
                    self.destroy_connection(handle);
                    return;
                }
                if let Some(conn) = self.table.get_mut(handle) {
                    conn.netinit = Some(state);
                } else {
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                    let _ = state.child.kill();
                    let _ = state.child.wait();
                }
            }
            Err(e) => {
                warn!(self.log, "failed to start netinit helper"; "error" => %e);
                self.send_packet(handle, PacketKind::Shutdown, None);
                self.destroy_connection(handle);
            }
        }
    }

    pub(crate) fn on_netinit_readable(&mut self, token: Token) {
        let handle = Self::handle_from_netinit_token(token);
        let full = match self.table.get_mut(handle) {
            Some(conn) => match conn.netinit.as_mut() {
                Some(state) => state.read_available(),
                None => return,
            },
            None => return,
        };
        if full {
            if let Some(conn) = self.table.get_mut(handle) {
                if let Some(state) = conn.netinit.as_ref() {
                    let fd = state.pipe_read_fd;
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                }
            }
        }
    }

    /// Reap any netinit children that have exited, draining final pipe bytes
    /// and admitting or rejecting the client (§4.4 step 5).
    pub(crate) fn run_netinit_child_reaps(&mut self) {
        let candidates = self.table.all_handles();
        for handle in candidates {
            let exit_status = match self.table.get_mut(handle) {
                Some(conn) => match conn.netinit.as_mut() {
                    Some(state) => match state.child.try_wait() {
                        Ok(Some(status)) => Some(status),
                        _ => None,
                    },
                    None => None,
                },
                None => None,
            };
            let status = match exit_status {
                Some(status) => status,
                None => continue,
            };

            if let Some(conn) = self.table.get_mut(handle) {
                if let Some(state) = conn.netinit.as_mut() {
                    state.read_available();
                    let fd = state.pipe_read_fd;
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                }
            }

            if !status.success() {
                warn!(self.log, "netinit helper rejected client"; "handle" => handle.0);
                self.send_packet(handle, PacketKind::Shutdown, None);
                self.destroy_connection(handle);
                continue;
            }

            let buffer = self
                .table
                .get_mut(handle)
                .and_then(|conn| conn.netinit.take())
                .map(|state| state.buffer);
            let payload = buffer.filter(|b| !b.is_empty());
            self.send_packet(handle, PacketKind::NetInit, payload.as_deref());
            debug!(self.log, "client admitted after netinit"; "handle" => handle.0);
        }
    }

    // ---- timer scheduler (§4.7) ----

    pub(crate) fn run_expired_timers(&mut self) {
        for handle in self.timers.poll_expired() {
            self.fire_timer(handle);
        }
    }

    fn fire_timer(&mut self, handle: ConnectionHandle) {
        let mut context = match self.table.get_mut(handle) {
            Some(conn) => match conn.context.take() {
                Some(c) => c,
                None => return,
            },
            None => return,
        };
        let remaining = self.authenticator.time_remaining(&context);
        if let Some(conn) = self.table.get_mut(handle) {
            conn.context = Some(context);
        } else {
            self.authenticator.delete(context);
            return;
        }
        match remaining {
            TimeRemaining::Seconds(s) if s > 0 => {
                self.timers.arm(handle, s);
            }
            TimeRemaining::Indefinite => {
                // No timer needed; nothing to re-arm (§4.3).
            }
            TimeRemaining::Seconds(_) | TimeRemaining::Expired | TimeRemaining::CredentialsExpired => {
                if self.config.flags.kill_on_timeout {
                    debug!(self.log, "context expired, killing connection"; "handle" => handle.0);
                    self.send_packet(handle, PacketKind::Shutdown, None);
                    self.destroy_connection(handle);
                } else {
                    debug!(self.log, "context expired, requesting reinit"; "handle" => handle.0);
                    if let Some(conn) = self.table.get_mut(handle) {
                        if let Some(ctx) = conn.context.take() {
                            self.authenticator.delete(ctx);
                        }
                        conn.gss_state = GssState::Fresh;
                        conn.principal_name = None;
                    }
                    self.send_packet(handle, PacketKind::GssInit, None);
                }
            }
        }
    }

    // ---- frame dispatcher (§4.5) ----

    pub(crate) fn on_tap_readable(&mut self) -> io::Result<()> {
        let mut buf = [0u8; MAX_FRAME_LEN];
        loop {
            match self.tap.read_frame(&mut buf)? {
                None => return Ok(()),
                Some(n) => self.dispatch_frame(&buf[..n]),
            }
        }
    }

    fn dispatch_frame(&mut self, frame: &[u8]) {
        if frame.len() < 6 {
            return;
        }
        let dst = MacAddr::from_slice(&frame[..6]).unwrap();
        if dst.is_broadcast() {
            for handle in self.table.ether_handles() {
                let established = self
                    .table
                    .get(handle)
                    .map_or(false, |c| c.gss_state.is_established());
                if !established {
                    trace!(self.log, "skipping broadcast for unestablished connection"; "handle" => handle.0);
                    continue;
                }
                self.send_data_wrapped(handle, frame);
            }
            return;
        }
        match self.table.find_by_mac(&dst) {
            Some(handle) => self.send_data_wrapped(handle, frame),
            None => trace!(self.log, "dropping frame for unknown destination"; "mac" => %dst),
        }
    }

    fn send_data_wrapped(&mut self, handle: ConnectionHandle, frame: &[u8]) {
        let mut context = match self.table.get_mut(handle) {
            Some(conn) => match conn.context.take() {
                Some(c) => c,
                None => return,
            },
            None => return,
        };
        let verdict = self.authenticator.wrap(&mut context, frame);
        if let Some(conn) = self.table.get_mut(handle) {
            conn.context = Some(context);
        }
        match verdict {
            WrapOutcome::Ok(ciphertext) => {
                self.send_packet(handle, PacketKind::Data, Some(&ciphertext));
            }
            WrapOutcome::RekeyNeeded => self.rekey(handle),
            WrapOutcome::Error => {
                warn!(self.log, "wrap failed, dropping frame"; "handle" => handle.0);
            }
        }
    }

    // ---- supervisor (§4.8) ----

    pub(crate) fn on_signals_readable(&mut self) {
        for signal in self.signals.pending() {
            debug!(self.log, "received termination signal"; "signal" => signal);
        }
        let handles = self.table.all_handles();
        for handle in handles {
            self.send_packet(handle, PacketKind::Shutdown, None);
            self.destroy_connection(handle);
        }
        self.begin_shutdown();
    }
}
