//! Wire protocol spoken between the instrumented client and the capture
//! engine: handshake, the record stream, and the server-to-client query
//! packets of the credit channel.

pub mod record;
pub mod wire;

pub use record::{AllocSite, LockKind, Record};
pub use wire::{Cursor, WireError};

use wire::Result;

/// First bytes on the wire, sent by the client.
pub const HANDSHAKE_SHIBBOLETH: &[u8; 8] = b"tracecap";

/// Bumped on any incompatible record or handshake change.
pub const PROTOCOL_VERSION: u32 = 5;

/// Upper bound on one decoded block. The client flushes before reaching it,
/// so a larger frame means a corrupt or hostile stream.
pub const TARGET_BLOCK_SIZE: usize = 256 * 1024;

/// Size of one encoded query packet: kind byte plus u64 token.
pub const QUERY_PACKET_SIZE: usize = 9;

/// One-byte handshake reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Welcome,
    ProtocolMismatch,
    NotAvailable,
    Dropped,
}

impl HandshakeStatus {
    pub fn to_u8(self) -> u8 {
        match self {
            HandshakeStatus::Welcome => 1,
            HandshakeStatus::ProtocolMismatch => 2,
            HandshakeStatus::NotAvailable => 3,
            HandshakeStatus::Dropped => 4,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(HandshakeStatus::Welcome),
            2 => Ok(HandshakeStatus::ProtocolMismatch),
            3 => Ok(HandshakeStatus::NotAvailable),
            4 => Ok(HandshakeStatus::Dropped),
            other => Err(WireError::UnknownHandshakeStatus(other)),
        }
    }
}

/// Session parameters sent by the client after a `Welcome` status.
/// When `on_demand` is set, a frame-offset payload (u64) follows.
#[derive(Debug, Clone, PartialEq)]
pub struct Welcome {
    /// Multiplier converting raw client timestamps to nanoseconds.
    pub timer_mul: f64,
    /// Initialization window of the client, in raw timestamps.
    pub init_begin: i64,
    pub init_end: i64,
    /// Unix epoch seconds at connection time.
    pub epoch: u64,
    pub on_demand: bool,
    pub program_name: String,
    pub host_info: String,
}

impl Welcome {
    pub fn write(&self, buf: &mut Vec<u8>) {
        wire::put_f64(buf, self.timer_mul);
        wire::put_i64(buf, self.init_begin);
        wire::put_i64(buf, self.init_end);
        wire::put_u64(buf, self.epoch);
        wire::put_u8(buf, self.on_demand as u8);
        wire::put_string(buf, &self.program_name);
        wire::put_string(buf, &self.host_info);
    }

    pub fn read(c: &mut Cursor<'_>) -> Result<Welcome> {
        Ok(Welcome {
            timer_mul: c.read_f64()?,
            init_begin: c.read_i64()?,
            init_end: c.read_i64()?,
            epoch: c.read_u64()?,
            on_demand: c.read_u8()? != 0,
            program_name: c.read_string()?,
            host_info: c.read_string()?,
        })
    }
}

/// Server-to-client request for data the stream referenced by token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    String,
    ThreadName,
    SourceLocation,
    PlotName,
    FrameName,
    CallstackFrame,
    Terminate,
    Disconnect,
}

impl QueryKind {
    fn to_u8(self) -> u8 {
        match self {
            QueryKind::String => 1,
            QueryKind::ThreadName => 2,
            QueryKind::SourceLocation => 3,
            QueryKind::PlotName => 4,
            QueryKind::FrameName => 5,
            QueryKind::CallstackFrame => 6,
            QueryKind::Terminate => 7,
            QueryKind::Disconnect => 8,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(QueryKind::String),
            2 => Ok(QueryKind::ThreadName),
            3 => Ok(QueryKind::SourceLocation),
            4 => Ok(QueryKind::PlotName),
            5 => Ok(QueryKind::FrameName),
            6 => Ok(QueryKind::CallstackFrame),
            7 => Ok(QueryKind::Terminate),
            8 => Ok(QueryKind::Disconnect),
            other => Err(WireError::UnknownQueryKind(other)),
        }
    }
}

/// Fixed-size query packet. The token is the client-side origin pointer
/// the record stream referenced, or zero for control kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Query {
    pub kind: QueryKind,
    pub token: u64,
}

impl Query {
    pub fn encode(&self) -> [u8; QUERY_PACKET_SIZE] {
        let mut out = [0u8; QUERY_PACKET_SIZE];
        out[0] = self.kind.to_u8();
        out[1..9].copy_from_slice(&self.token.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8; QUERY_PACKET_SIZE]) -> Result<Query> {
        let kind = QueryKind::from_u8(buf[0])?;
        let mut t = [0u8; 8];
        t.copy_from_slice(&buf[1..9]);
        Ok(Query {
            kind,
            token: u64::from_le_bytes(t),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn welcome_roundtrip() {
        let w = Welcome {
            timer_mul: 2.5,
            init_begin: 100,
            init_end: 4200,
            epoch: 1_700_000_000,
            on_demand: true,
            program_name: "game".into(),
            host_info: "linux x86_64".into(),
        };
        let mut buf = Vec::new();
        w.write(&mut buf);
        let mut c = Cursor::new(&buf);
        assert_eq!(Welcome::read(&mut c).unwrap(), w);
        assert!(c.is_empty());
    }

    #[rstest]
    #[case(QueryKind::String, 0xdead_beef)]
    #[case(QueryKind::SourceLocation, u64::MAX)]
    #[case(QueryKind::Terminate, 0)]
    fn query_packet_roundtrip(#[case] kind: QueryKind, #[case] token: u64) {
        let q = Query { kind, token };
        let buf = q.encode();
        assert_eq!(Query::decode(&buf).unwrap(), q);
    }

    #[test]
    fn handshake_status_rejects_unknown() {
        assert_eq!(
            HandshakeStatus::from_u8(9),
            Err(WireError::UnknownHandshakeStatus(9))
        );
    }
}
