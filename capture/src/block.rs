use std::mem;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use lz4_flex::block::{
    compress_prepend_size_with_dict, decompress_size_prepended_with_dict,
    get_maximum_output_size,
};
use protocol::TARGET_BLOCK_SIZE;

use crate::error::{CaptureError, Result};
use crate::transport::{read_exact, Transport};

/// Reads `[u32 len][lz4 payload]` frames. Each block is compressed against
/// the previous decoded block, so blocks must be consumed in stream order.
pub struct BlockReader {
    dict: Vec<u8>,
    current: Vec<u8>,
    frame: Vec<u8>,
}

impl BlockReader {
    pub fn new() -> Self {
        BlockReader {
            dict: Vec::new(),
            current: Vec::new(),
            frame: Vec::with_capacity(TARGET_BLOCK_SIZE),
        }
    }

    pub fn read_block<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<&[u8]> {
        let mut len = [0u8; 4];
        read_exact(transport, &mut len, timeout, cancel)?;
        let len = u32::from_le_bytes(len) as usize;
        if len > get_maximum_output_size(TARGET_BLOCK_SIZE) + 4 {
            return Err(CaptureError::OversizedBlock(len));
        }
        self.frame.resize(len, 0);
        read_exact(transport, &mut self.frame, timeout, cancel)?;

        mem::swap(&mut self.dict, &mut self.current);
        self.current = decompress_size_prepended_with_dict(&self.frame, &self.dict)?;
        if self.current.len() > TARGET_BLOCK_SIZE {
            return Err(CaptureError::OversizedBlock(self.current.len()));
        }
        Ok(&self.current)
    }
}

impl Default for BlockReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Counterpart framing writer, used by tests and replay tooling.
pub struct BlockWriter {
    dict: Vec<u8>,
}

impl BlockWriter {
    pub fn new() -> Self {
        BlockWriter { dict: Vec::new() }
    }

    pub fn write_block<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        payload: &[u8],
    ) -> Result<()> {
        debug_assert!(payload.len() <= TARGET_BLOCK_SIZE);
        let compressed = compress_prepend_size_with_dict(payload, &self.dict);
        transport.write_all(&(compressed.len() as u32).to_le_bytes())?;
        transport.write_all(&compressed)?;
        self.dict = payload.to_vec();
        Ok(())
    }
}

impl Default for BlockWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ChannelTransport;

    #[test]
    fn blocks_roundtrip_with_dict_continuity() {
        let (mut server, mut client) = ChannelTransport::pair();
        let blocks: Vec<Vec<u8>> = vec![
            b"first block with some repetition repetition".to_vec(),
            b"second block with some repetition repetition".to_vec(),
            vec![7u8; 1000],
        ];
        let mut writer = BlockWriter::new();
        for b in &blocks {
            writer.write_block(&mut client, b).unwrap();
        }

        let mut reader = BlockReader::new();
        let cancel = AtomicBool::new(false);
        for expected in &blocks {
            let got = reader
                .read_block(&mut server, Duration::from_millis(200), &cancel)
                .unwrap();
            assert_eq!(got, expected.as_slice());
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let (mut server, client) = ChannelTransport::pair();
        client
            .outgoing
            .send((u32::MAX).to_le_bytes().to_vec())
            .unwrap();
        let mut reader = BlockReader::new();
        let cancel = AtomicBool::new(false);
        let err = reader.read_block(&mut server, Duration::from_millis(200), &cancel);
        assert!(matches!(err, Err(CaptureError::OversizedBlock(_))));
    }
}
