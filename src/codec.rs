//! The on-wire packet framing codec (§6). In the production system this is a
//! separate module maintained alongside the layered cryptographic framing;
//! here it is implemented directly against the contract the core relies on,
//! since nothing else in the retrieval pack supplies it. `encode`/`decode`
//! only handle framing — whether a packet's payload is sealed under a
//! client's context is a decision the state machine makes explicitly
//! per-kind (§4.3's `DATA(ct)` row is the only one that unwraps), not
//! something the codec does on their behalf.
//!
//! Wire shape: `kind: u8 | session_id: u16 (big endian) | payload...`.

use std::net::SocketAddrV4;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use failure::Fail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Data = 0,
    GssInit = 1,
    NetInit = 2,
    NetStart = 3,
    Shutdown = 4,
    Echo = 5,
}

impl PacketKind {
    fn from_u8(b: u8) -> Option<PacketKind> {
        Some(match b {
            0 => PacketKind::Data,
            1 => PacketKind::GssInit,
            2 => PacketKind::NetInit,
            3 => PacketKind::NetStart,
            4 => PacketKind::Shutdown,
            5 => PacketKind::Echo,
            _ => return None,
        })
    }
}

pub struct Packet {
    pub kind: PacketKind,
    pub session_id: u16,
    pub payload: Bytes,
}

#[derive(Debug, Fail, PartialEq, Eq)]
pub enum DecodeError {
    #[fail(display = "datagram shorter than the fixed header")]
    Truncated,
    #[fail(display = "unrecognized packet kind {}", _0)]
    UnknownKind(u8),
    /// §6: "a special codec return distinguishes `rekey_needed` from other
    /// failures." A peer that has locally discarded its context (e.g. after
    /// its own key rollover) marks the datagram with this reserved kind byte
    /// instead of running it through `GSSINIT`; the session id is still
    /// framed normally so the dispatcher can find the right connection
    /// without trying to authenticate anything (§4.6).
    #[fail(display = "peer requested a rekey for session {}", _0)]
    RekeyNeeded(u16),
}

const HEADER_LEN: usize = 3;
const REKEY_SENTINEL: u8 = 0xfe;

/// Frame a packet. `payload` is already whatever bytes belong on the wire —
/// ciphertext for `DATA`, a raw GSS token for `GSSINIT`, a learned MAC plus
/// opaque tail for `NETINIT` — the caller decides and wraps beforehand.
pub fn encode(kind: PacketKind, session_id: u16, payload: Option<&[u8]>) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.map_or(0, <[u8]>::len));
    buf.put_u8(kind as u8);
    let mut session_buf = [0u8; 2];
    BigEndian::write_u16(&mut session_buf, session_id);
    buf.put_slice(&session_buf);
    if let Some(p) = payload {
        buf.put_slice(p);
    }
    buf.freeze()
}

/// Parse a raw datagram's framing. Malformed datagrams are dropped silently
/// by the caller (§4.6: "the wire is untrusted") — this just reports why.
pub fn decode(datagram: &[u8], peer: SocketAddrV4) -> Result<(Packet, SocketAddrV4), DecodeError> {
    if datagram.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    let session_id = BigEndian::read_u16(&datagram[1..3]);
    if datagram[0] == REKEY_SENTINEL {
        return Err(DecodeError::RekeyNeeded(session_id));
    }
    let kind = PacketKind::from_u8(datagram[0]).ok_or(DecodeError::UnknownKind(datagram[0]))?;
    let payload = Bytes::from(datagram[HEADER_LEN..].to_vec());
    Ok((
        Packet {
            kind,
            session_id,
            payload,
        },
        peer,
    ))
}
