use std::io::{Read, Write};

use crate::error::{CaptureError, Result};

pub const MAGIC: &[u8; 5] = b"trcap";

/// Semantic capture-file version, one byte per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

/// Absolute little-endian timestamps, no zone names, no message colors,
/// no frame offset.
pub const V0_1_0: Version = Version { major: 0, minor: 1, patch: 0 };
/// Running-reference i64 time deltas; zone name, message color and frame
/// offset fields added.
pub const V0_1_5: Version = Version { major: 0, minor: 1, patch: 5 };
/// Zigzag varint time deltas.
pub const V0_2_0: Version = Version { major: 0, minor: 2, patch: 0 };

pub const CURRENT: Version = V0_2_0;

/// Caps every length field in the file. A count past this is corruption,
/// not data.
pub const MAX_SECTION_LEN: u32 = 1 << 30;

pub trait WriteLeExt: Write {
    fn write_u8_le(&mut self, v: u8) -> std::io::Result<()> {
        self.write_all(&[v])
    }
    fn write_u16_le(&mut self, v: u16) -> std::io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }
    fn write_i16_le(&mut self, v: i16) -> std::io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }
    fn write_u32_le(&mut self, v: u32) -> std::io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }
    fn write_u64_le(&mut self, v: u64) -> std::io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }
    fn write_i64_le(&mut self, v: i64) -> std::io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }
    fn write_f32_le(&mut self, v: f32) -> std::io::Result<()> {
        self.write_all(&v.to_bits().to_le_bytes())
    }
    fn write_f64_le(&mut self, v: f64) -> std::io::Result<()> {
        self.write_all(&v.to_bits().to_le_bytes())
    }
    fn write_str_le(&mut self, s: &str) -> std::io::Result<()> {
        self.write_u32_le(s.len() as u32)?;
        self.write_all(s.as_bytes())
    }
}

impl<W: Write + ?Sized> WriteLeExt for W {}

pub trait ReadLeExt: Read {
    fn read_u8_le(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }
    fn read_u16_le(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }
    fn read_i16_le(&mut self) -> Result<i16> {
        Ok(self.read_u16_le()? as i16)
    }
    fn read_u32_le(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }
    fn read_u64_le(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }
    fn read_i64_le(&mut self) -> Result<i64> {
        Ok(self.read_u64_le()? as i64)
    }
    fn read_f32_le(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32_le()?))
    }
    fn read_f64_le(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64_le()?))
    }
    fn read_count_le(&mut self) -> Result<usize> {
        let n = self.read_u32_le()?;
        if n > MAX_SECTION_LEN {
            return Err(CaptureError::Corrupt("length field out of range"));
        }
        Ok(n as usize)
    }
    fn read_str_le(&mut self) -> Result<String> {
        let len = self.read_count_le()?;
        // The length comes from the file; read through `take` so a corrupt
        // count cannot force a giant upfront allocation.
        let mut buf = Vec::with_capacity(len.min(4096));
        let n = (&mut *self).take(len as u64).read_to_end(&mut buf)?;
        if n != len {
            return Err(CaptureError::Corrupt("string cut short"));
        }
        String::from_utf8(buf).map_err(|_| CaptureError::Corrupt("string is not utf-8"))
    }
}

impl<R: Read + ?Sized> ReadLeExt for R {}

/// Zigzag LEB128, the time encoding of the current format.
pub fn write_varint<W: Write + ?Sized>(w: &mut W, v: i64) -> std::io::Result<()> {
    let mut u = ((v << 1) ^ (v >> 63)) as u64;
    loop {
        let byte = (u & 0x7f) as u8;
        u >>= 7;
        if u == 0 {
            return w.write_all(&[byte]);
        }
        w.write_all(&[byte | 0x80])?;
    }
}

pub fn read_varint<R: Read + ?Sized>(r: &mut R) -> Result<i64> {
    let mut u: u64 = 0;
    let mut shift = 0u32;
    loop {
        let b = r.read_u8_le()?;
        u |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(CaptureError::Corrupt("varint too long"));
        }
    }
    Ok(((u >> 1) as i64) ^ -((u & 1) as i64))
}

pub fn write_header<W: Write + ?Sized>(w: &mut W, version: Version) -> std::io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&[version.major, version.minor, version.patch])
}

pub fn read_header<R: Read + ?Sized>(r: &mut R) -> Result<Version> {
    let mut magic = [0u8; 5];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CaptureError::InvalidMagic);
    }
    let mut v = [0u8; 3];
    r.read_exact(&mut v)?;
    Ok(Version { major: v[0], minor: v[1], patch: v[2] })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(-1)]
    #[case(300)]
    #[case(-300)]
    #[case(i64::MAX)]
    #[case(i64::MIN)]
    fn varint_roundtrip(#[case] v: i64) {
        let mut buf = Vec::new();
        write_varint(&mut buf, v).unwrap();
        let mut r = buf.as_slice();
        assert_eq!(read_varint(&mut r).unwrap(), v);
        assert!(r.is_empty());
    }

    #[test]
    fn small_deltas_take_one_byte() {
        for v in -64i64..64 {
            let mut buf = Vec::new();
            write_varint(&mut buf, v).unwrap();
            assert_eq!(buf.len(), 1);
        }
    }

    #[test]
    fn header_roundtrip_and_bad_magic() {
        let mut buf = Vec::new();
        write_header(&mut buf, CURRENT).unwrap();
        assert_eq!(read_header(&mut buf.as_slice()).unwrap(), CURRENT);

        let bad = b"nocapxxx";
        assert!(matches!(
            read_header(&mut bad.as_slice()),
            Err(CaptureError::InvalidMagic)
        ));
    }
}
