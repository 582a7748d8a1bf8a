use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{CaptureError, Result};

/// Byte stream carrying the capture session. A return of 0 from `read`
/// means the timeout elapsed with no data, not end of stream.
pub trait Transport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.set_read_timeout(Some(timeout))?;
        match Read::read(self, buf) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(self, buf)
    }
}

/// Fills `buf` completely, polling with short timeouts so the cancel flag
/// is observed between reads.
pub fn read_exact<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    timeout: Duration,
    cancel: &AtomicBool,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        if cancel.load(Ordering::Relaxed) {
            return Err(CaptureError::ConnectionLost);
        }
        let n = transport
            .read(&mut buf[filled..], timeout)
            .map_err(|_| CaptureError::ConnectionLost)?;
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::mpsc::{Receiver, Sender, TryRecvError};

    /// In-memory transport half. Reads pull from a channel fed by the peer,
    /// writes push to the peer's channel. Used by session tests.
    pub struct ChannelTransport {
        pub incoming: Receiver<Vec<u8>>,
        pub outgoing: Sender<Vec<u8>>,
        buffered: VecDeque<u8>,
    }

    impl ChannelTransport {
        pub fn pair() -> (ChannelTransport, ChannelTransport) {
            let (a_tx, a_rx) = std::sync::mpsc::channel();
            let (b_tx, b_rx) = std::sync::mpsc::channel();
            (
                ChannelTransport { incoming: a_rx, outgoing: b_tx, buffered: VecDeque::new() },
                ChannelTransport { incoming: b_rx, outgoing: a_tx, buffered: VecDeque::new() },
            )
        }
    }

    impl Transport for ChannelTransport {
        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            if self.buffered.is_empty() {
                match self.incoming.recv_timeout(timeout) {
                    Ok(chunk) => self.buffered.extend(chunk),
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => return Ok(0),
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        return Err(io::Error::from(io::ErrorKind::UnexpectedEof))
                    }
                }
            }
            let n = buf.len().min(self.buffered.len());
            for b in buf.iter_mut().take(n) {
                *b = self.buffered.pop_front().unwrap();
            }
            Ok(n)
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.outgoing
                .send(buf.to_vec())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }

    impl ChannelTransport {
        /// Drains writes the peer has already sent without blocking.
        pub fn try_drain(&mut self) -> Vec<u8> {
            let mut out: Vec<u8> = self.buffered.drain(..).collect();
            loop {
                match self.incoming.try_recv() {
                    Ok(chunk) => out.extend(chunk),
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ChannelTransport;
    use super::*;

    #[test]
    fn read_exact_crosses_chunk_boundaries() {
        let (mut a, b) = ChannelTransport::pair();
        b.outgoing.send(vec![1, 2]).unwrap();
        b.outgoing.send(vec![3, 4, 5]).unwrap();
        let cancel = AtomicBool::new(false);
        let mut buf = [0u8; 5];
        read_exact(&mut a, &mut buf, Duration::from_millis(100), &cancel).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn read_exact_observes_cancellation() {
        let (mut a, _b) = ChannelTransport::pair();
        let cancel = AtomicBool::new(true);
        let mut buf = [0u8; 4];
        let err = read_exact(&mut a, &mut buf, Duration::from_millis(10), &cancel);
        assert!(matches!(err, Err(CaptureError::ConnectionLost)));
    }
}
