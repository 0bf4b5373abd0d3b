//! The authenticator adapter (§4.1): a thin capability surface over whatever
//! security mechanism the launcher wires in. This crate never speaks GSSAPI
//! directly — callers provide an `Authenticator` impl (a real GSSAPI binding
//! lives outside this crate entirely, per §1).

use failure::Fail;

/// Remaining lifetime of a context, as reported by `time_remaining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRemaining {
    Seconds(u32),
    Indefinite,
    Expired,
    CredentialsExpired,
}

/// Outcome of advancing a context with a client-supplied token.
pub enum AcceptOutcome<C> {
    /// The context needs another round trip; `out_token` must be sent to the peer.
    Continue { context: C, out_token: Vec<u8> },
    /// The context is usable. `peer_name` identifies the client; `remaining`
    /// is `None` for an indefinite lifetime.
    Complete {
        context: C,
        out_token: Option<Vec<u8>>,
        peer_name: String,
        remaining: Option<u32>,
    },
}

#[derive(Debug, Fail)]
#[fail(display = "security context negotiation failed")]
pub struct AcceptError;

/// Verdict of `wrap`/`unwrap`. `RekeyNeeded` is distinguished from other
/// errors because it drives the rekey path (§4.1, §4.3).
pub enum WrapOutcome {
    Ok(Vec<u8>),
    RekeyNeeded,
    Error,
}

/// The capability surface §4.1 specifies. `Context` is an opaque per-client
/// handle owned by the implementation; this crate only ever holds it behind
/// `Option<A::Context>` and never inspects it.
pub trait Authenticator {
    type Context;

    /// Acquire accept-side credentials for a host-based service principal.
    /// Called once at startup; failure is fatal (§7).
    fn acquire_server_credentials(&mut self, service_name: &str) -> Result<(), AcceptError>;

    /// Advance (or create) a context with an inbound token from the client.
    fn accept(
        &mut self,
        context: Option<Self::Context>,
        in_token: &[u8],
    ) -> Result<AcceptOutcome<Self::Context>, AcceptError>;

    fn wrap(&mut self, context: &mut Self::Context, plaintext: &[u8]) -> WrapOutcome;
    fn unwrap(&mut self, context: &mut Self::Context, ciphertext: &[u8]) -> WrapOutcome;

    fn delete(&mut self, context: Self::Context);

    fn time_remaining(&mut self, context: &Self::Context) -> TimeRemaining;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! An in-memory mock authenticator for tests. Not a real security
    //! mechanism: tokens simply echo a counter so tests can drive the
    //! handshake deterministically without a GSSAPI environment.
    use super::*;
    use rand::Rng;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MockContext {
        id: u64,
        pub peer_name: String,
        established: bool,
    }

    pub struct MockAuthenticator {
        pub credentials_acquired: bool,
        /// Number of `GSSINIT` round trips required before a context completes.
        pub rounds_to_complete: u32,
        /// Lifetime reported once a context completes. `None` means indefinite.
        pub lifetime_seconds: Option<u32>,
        /// When set, `time_remaining` reports `Expired` regardless of
        /// `lifetime_seconds`, so tests can drive the §4.3/§4.7 expiry path
        /// without waiting out a real deadline.
        pub force_expired: bool,
        rounds: HashMap<u64, u32>,
        next_id: u64,
    }

    impl MockAuthenticator {
        pub fn new() -> Self {
            MockAuthenticator {
                credentials_acquired: false,
                rounds_to_complete: 1,
                lifetime_seconds: Some(3600),
                force_expired: false,
                rounds: HashMap::new(),
                next_id: 1,
            }
        }
    }

    impl Authenticator for MockAuthenticator {
        type Context = MockContext;

        fn acquire_server_credentials(&mut self, _service_name: &str) -> Result<(), AcceptError> {
            self.credentials_acquired = true;
            Ok(())
        }

        fn accept(
            &mut self,
            context: Option<MockContext>,
            in_token: &[u8],
        ) -> Result<AcceptOutcome<MockContext>, AcceptError> {
            if in_token == b"REJECT" {
                return Err(AcceptError);
            }
            let (id, round) = match context {
                Some(c) => {
                    let round = self.rounds.entry(c.id).or_insert(0);
                    *round += 1;
                    (c.id, *round)
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.rounds.insert(id, 1);
                    (id, 1)
                }
            };
            if round < self.rounds_to_complete {
                let ctx = MockContext {
                    id,
                    peer_name: String::new(),
                    established: false,
                };
                return Ok(AcceptOutcome::Continue {
                    context: ctx,
                    out_token: format!("tok{}", round).into_bytes(),
                });
            }
            let mut rng = rand::thread_rng();
            let peer_name = format!("client{}@EXAMPLE.COM", rng.gen::<u16>());
            let ctx = MockContext {
                id,
                peer_name: peer_name.clone(),
                established: true,
            };
            Ok(AcceptOutcome::Complete {
                context: ctx,
                out_token: None,
                peer_name,
                remaining: self.lifetime_seconds,
            })
        }

        fn wrap(&mut self, context: &mut MockContext, plaintext: &[u8]) -> WrapOutcome {
            if !context.established {
                return WrapOutcome::Error;
            }
            let mut buf = Vec::with_capacity(plaintext.len() + 4);
            buf.extend_from_slice(b"WRAP");
            buf.extend_from_slice(plaintext);
            WrapOutcome::Ok(buf)
        }

        fn unwrap(&mut self, context: &mut MockContext, ciphertext: &[u8]) -> WrapOutcome {
            if !context.established {
                return WrapOutcome::Error;
            }
            if ciphertext.len() < 4 || &ciphertext[..4] != b"WRAP" {
                return WrapOutcome::RekeyNeeded;
            }
            WrapOutcome::Ok(ciphertext[4..].to_vec())
        }

        fn delete(&mut self, context: MockContext) {
            self.rounds.remove(&context.id);
        }

        fn time_remaining(&mut self, _context: &MockContext) -> TimeRemaining {
            if self.force_expired {
                return TimeRemaining::Expired;
            }
            match self.lifetime_seconds {
                Some(s) => TimeRemaining::Seconds(s),
                None => TimeRemaining::Indefinite,
            }
        }
    }
}
