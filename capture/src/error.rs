use protocol::HandshakeStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection lost")]
    ConnectionLost,
    #[error("handshake rejected with status {0:?}")]
    HandshakeRejected(HandshakeStatus),
    #[error("block decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error("wire decode failed: {0}")]
    Wire(#[from] protocol::WireError),
    #[error("block of {0} bytes exceeds the protocol limit")]
    OversizedBlock(usize),
    #[error("not a capture file")]
    InvalidMagic,
    #[error("capture file version {0}.{1}.{2} is newer than this reader")]
    UnsupportedVersion(u8, u8, u8),
    #[error("capture file corrupt: {0}")]
    Corrupt(&'static str),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// A protocol-level desynchronization. Terminal for the session; the model
/// reconstructed before the failing record stays readable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFailure {
    #[error("zone end on thread {thread:#x} with no open zone")]
    ZoneEndMismatch { thread: u64 },
    #[error("zone id mismatch on thread {thread:#x}: expected {expected}, found {found}")]
    ZoneIdMismatch { thread: u64, expected: u32, found: u32 },
    #[error("zone text on thread {thread:#x} with no open zone")]
    ZoneTextMismatch { thread: u64 },
    #[error("zone name on thread {thread:#x} with no open zone")]
    ZoneNameMismatch { thread: u64 },
    #[error("frame end for an unopened discontinuous frame set")]
    FrameEndMismatch,
    #[error("free of ptr {ptr:#x} on thread {thread:#x} with no active allocation")]
    FreeWithoutAlloc { thread: u64, ptr: u64 },
    #[error("allocation at ptr {ptr:#x} already active")]
    DoubleAlloc { ptr: u64 },
    #[error("lock event for unannounced lock {id}")]
    UnknownLock { id: u32 },
    #[error("gpu event for unknown context {context}")]
    UnknownGpuContext { context: u8 },
    #[error("gpu zone end in context {context} with no open zone")]
    GpuZoneEndMismatch { context: u8 },
    #[error("gpu query slot {query_id} misuse in context {context}")]
    GpuQuerySlot { context: u8, query_id: u16 },
    #[error("zone references unknown inline source location {token:#x}")]
    UnknownSourceLocationPayload { token: u64 },
    #[error("callstack payload arrived with no requesting event")]
    CallstackDesync,
}
