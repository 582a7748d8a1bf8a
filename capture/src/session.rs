use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard};
use protocol::{
    Cursor, HandshakeStatus, Query, QueryKind, Record, Welcome, HANDSHAKE_SHIBBOLETH,
    PROTOCOL_VERSION,
};
use tracing::{debug, info, warn};

use crate::block::BlockReader;
use crate::dispatch::{Ingest, MemFreePolicy};
use crate::error::{CaptureError, Result, StreamFailure};
use crate::query::QueryChannel;
use crate::stats::{spawn_statistics, Statistics};
use crate::transport::{read_exact, Transport};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-read timeout; the cancel flag is observed at this granularity.
    pub read_timeout: Duration,
    /// Sizes the query credit: the client's advertised receive capacity.
    pub send_buffer_bytes: usize,
    /// Overrides the free-without-alloc policy; the default follows the
    /// on-demand flag of the welcome.
    pub mem_free_policy: Option<MemFreePolicy>,
    pub capture_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            read_timeout: Duration::from_millis(250),
            send_buffer_bytes: 64 * 1024,
            mem_free_policy: None,
            capture_name: String::new(),
        }
    }
}

/// Handshake result. A non-welcome status is an outcome to report, not an
/// error; the client stays untouched for the next attempt.
pub enum Connect<T: Transport> {
    Accepted(Session<T>),
    Rejected(HandshakeStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Client-initiated terminate, fully drained.
    Terminated,
    /// The transport closed mid-stream. The model up to that point stays
    /// readable.
    Disconnected,
    Cancelled,
    Desynchronized(StreamFailure),
}

/// Cloneable read access to a live or finished capture.
#[derive(Clone)]
pub struct CaptureHandle {
    ingest: Arc<RwLock<Ingest>>,
    stats: Arc<OnceLock<Statistics>>,
}

impl CaptureHandle {
    pub fn read(&self) -> RwLockReadGuard<'_, Ingest> {
        self.ingest.read()
    }

    /// None until the background aggregation has finished.
    pub fn statistics(&self) -> Option<&Statistics> {
        self.stats.get()
    }
}

pub struct Session<T: Transport> {
    transport: T,
    config: SessionConfig,
    ingest: Arc<RwLock<Ingest>>,
    stats: Arc<OnceLock<Statistics>>,
    queries: QueryChannel,
    blocks: BlockReader,
    cancel: Arc<AtomicBool>,
}

impl<T: Transport> Session<T> {
    /// Runs the handshake: shibboleth and protocol version out, status
    /// byte back, then the welcome payload on acceptance.
    pub fn connect(
        mut transport: T,
        config: SessionConfig,
        cancel: Arc<AtomicBool>,
    ) -> Result<Connect<T>> {
        transport.write_all(HANDSHAKE_SHIBBOLETH)?;
        transport.write_all(&PROTOCOL_VERSION.to_le_bytes())?;

        let mut status = [0u8; 1];
        read_exact(&mut transport, &mut status, config.read_timeout, &cancel)?;
        let status = HandshakeStatus::from_u8(status[0])?;
        if status != HandshakeStatus::Welcome {
            debug!(?status, "handshake rejected");
            return Ok(Connect::Rejected(status));
        }

        let mut len = [0u8; 4];
        read_exact(&mut transport, &mut len, config.read_timeout, &cancel)?;
        let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
        read_exact(&mut transport, &mut payload, config.read_timeout, &cancel)?;
        let welcome = Welcome::read(&mut Cursor::new(&payload))?;

        // On-demand clients also announce how many frames precede us.
        let frame_offset = if welcome.on_demand {
            let mut buf = [0u8; 8];
            read_exact(&mut transport, &mut buf, config.read_timeout, &cancel)?;
            u64::from_le_bytes(buf)
        } else {
            0
        };

        let policy = config.mem_free_policy.unwrap_or(if welcome.on_demand {
            MemFreePolicy::Tolerate
        } else {
            MemFreePolicy::Fail
        });
        let mut ingest = Ingest::new(policy);
        ingest.apply_welcome(&welcome, frame_offset);
        ingest.model.capture_name = config.capture_name.clone();
        info!(
            program = %welcome.program_name,
            on_demand = welcome.on_demand,
            "session established"
        );

        let queries = QueryChannel::new(config.send_buffer_bytes);
        Ok(Connect::Accepted(Session {
            transport,
            config,
            ingest: Arc::new(RwLock::new(ingest)),
            stats: Arc::new(OnceLock::new()),
            queries,
            blocks: BlockReader::new(),
            cancel,
        }))
    }

    pub fn handle(&self) -> CaptureHandle {
        CaptureHandle {
            ingest: Arc::clone(&self.ingest),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Consumes blocks until the stream completes. The write lock is held
    /// for one decoded block at a time, so handle readers interleave.
    pub fn run(mut self) -> Result<SessionOutcome> {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                self.ingest.write().flush_postponed(true);
                let _ = self
                    .transport
                    .write_all(&Query { kind: QueryKind::Disconnect, token: 0 }.encode());
                return Ok(SessionOutcome::Cancelled);
            }

            let block = match self.blocks.read_block(
                &mut self.transport,
                self.config.read_timeout,
                &self.cancel,
            ) {
                Ok(block) => block,
                Err(CaptureError::ConnectionLost) => {
                    // The partial model stays readable; leave no samples
                    // behind in the postponed buffers.
                    self.ingest.write().flush_postponed(true);
                    return Ok(if self.cancel.load(Ordering::Relaxed) {
                        SessionOutcome::Cancelled
                    } else {
                        warn!("client connection lost");
                        SessionOutcome::Disconnected
                    });
                }
                Err(e) => return Err(e),
            };

            let (queries, replenish, done) = {
                let mut guard = self.ingest.write();
                let mut cursor = Cursor::new(block);
                while !cursor.is_empty() {
                    let record = Record::decode(&mut cursor)?;
                    if let Err(failure) = guard.process(record) {
                        warn!(%failure, "stream desynchronized");
                        guard.flush_postponed(true);
                        return Ok(SessionOutcome::Desynchronized(failure));
                    }
                }
                guard.flush_postponed(false);
                let terminated = guard.terminated();
                if terminated {
                    guard.flush_postponed(true);
                }
                (
                    guard.take_queries(),
                    guard.take_replenish(),
                    terminated && guard.quiescent(),
                )
            };

            for _ in 0..replenish {
                self.queries.replenish(&mut self.transport)?;
            }
            for query in queries {
                self.queries.send(&mut self.transport, query)?;
            }

            if done {
                debug!("terminate drained");
                let _ = self
                    .transport
                    .write_all(&Query { kind: QueryKind::Disconnect, token: 0 }.encode());
                spawn_statistics(Arc::clone(&self.ingest), Arc::clone(&self.stats))?;
                return Ok(SessionOutcome::Terminated);
            }
        }
    }
}
