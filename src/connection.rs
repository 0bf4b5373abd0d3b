//! Connection data (§3) and the context state machine (§4.3).

use std::net::SocketAddrV4;

use slog::Logger;

use crate::mac::MacAddr;
use crate::netinit::NetinitState;

/// Mirrors §4.3's four live states plus the terminal `Dead`. `Dead` is never
/// observed by callers directly — reaching it means the connection has
/// already been destroyed and removed from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GssState {
    Fresh,
    Handshaking,
    Established,
    Expiring,
}

impl GssState {
    pub fn is_established(&self) -> bool {
        *self == GssState::Established
    }
}

impl Default for GssState {
    fn default() -> Self {
        GssState::Fresh
    }
}

/// One remote client (§3). Generic over `C`, the authenticator's opaque
/// per-client context type, so this module never depends on `auth::Authenticator`
/// directly.
pub struct Connection<C> {
    pub peer: SocketAddrV4,
    pub session_id: u16,
    pub mac: MacAddr,
    pub context: Option<C>,
    pub gss_state: GssState,
    pub principal_name: Option<String>,
    pub netinit: Option<NetinitState>,
    /// Seconds remaining as of the last `time_remaining` call, used to
    /// re-arm the timeout scheduler (§4.7). `None` means no timer is armed
    /// (either unestablished, or the context reported an indefinite lifetime).
    pub timer_deadline_secs: Option<u32>,
    pub log: Logger,
}

impl<C> Connection<C> {
    /// A brand-new connection as `get_or_create` allocates it: zeroed MAC,
    /// no context, `Fresh` state (§4.2).
    pub fn fresh(peer: SocketAddrV4, session_id: u16) -> Self {
        Connection {
            peer,
            session_id,
            mac: MacAddr::ZERO,
            context: None,
            gss_state: GssState::Fresh,
            principal_name: None,
            netinit: None,
            timer_deadline_secs: None,
            log: Logger::root(slog::Discard, slog::o!()),
        }
    }

    pub fn with_logger(mut self, log: Logger) -> Self {
        self.log = log;
        self
    }

    /// A `DATA` packet is accepted only if established and the MAC has been
    /// learned (§3 invariants, §4.3).
    pub fn accepts_data(&self) -> bool {
        self.gss_state.is_established() && !self.mac.is_zero()
    }

    /// Reconcile a peer address observed on a received packet against the
    /// stored one (mobility / NAT rebinding, §4.3). Called after the table
    /// has already resolved the packet to this connection by `(ip,
    /// session_id)` (`ConnectionTable` matches port-agnostically, see
    /// `table.rs`), so a changed source port — or a changed full address —
    /// shows up here and gets written back.
    pub fn reconcile_peer(&mut self, observed: SocketAddrV4) {
        if self.peer != observed {
            slog::debug!(self.log, "peer address changed"; "old" => %self.peer, "new" => %observed);
            self.peer = observed;
        }
    }
}
