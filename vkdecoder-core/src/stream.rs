//! Byte stream carrying snapshots.
//!
//! Multi-byte integers are big-endian on the wire. The embedder supplies
//! the transport; [`MemStream`] backs tests and in-memory round trips.

use std::io;

pub trait Stream: Send {
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<()>;

    fn put_byte(&mut self, value: u8) -> io::Result<()> {
        self.write(&[value])
    }

    fn get_byte(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read(&mut buf)?;
        Ok(buf[0])
    }

    fn put_be32(&mut self, value: u32) -> io::Result<()> {
        self.write(&value.to_be_bytes())
    }

    fn get_be32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn put_be64(&mut self, value: u64) -> io::Result<()> {
        self.write(&value.to_be_bytes())
    }

    fn get_be64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Length-prefixed byte block.
    fn put_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.put_be64(bytes.len() as u64)?;
        self.write(bytes)
    }

    fn get_bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = self.get_be64()? as usize;
        let mut buf = vec![0u8; len];
        self.read(&mut buf)?;
        Ok(buf)
    }

    fn put_string(&mut self, value: &str) -> io::Result<()> {
        self.put_bytes(value.as_bytes())
    }

    fn get_string(&mut self) -> io::Result<String> {
        String::from_utf8(self.get_bytes()?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Growable in-memory stream; reads consume from the front.
#[derive(Default)]
pub struct MemStream {
    buf: Vec<u8>,
    read_pos: usize,
}

impl MemStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf, read_pos: 0 }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.read_pos
    }
}

impl Stream for MemStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let available = self.buf.len() - self.read_pos;
        if buf.len() > available {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("snapshot stream short read: want {}, have {available}", buf.len()),
            ));
        }
        buf.copy_from_slice(&self.buf[self.read_pos..self.read_pos + buf.len()]);
        self.read_pos += buf.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_round_trip() {
        let mut s = MemStream::new();
        s.put_be32(0x0102_0304).unwrap();
        s.put_be64(0x0506_0708_090a_0b0c).unwrap();
        s.put_byte(0xfe).unwrap();
        s.put_string("etc2").unwrap();

        assert_eq!(&s.buf[..4], &[1, 2, 3, 4]);

        assert_eq!(s.get_be32().unwrap(), 0x0102_0304);
        assert_eq!(s.get_be64().unwrap(), 0x0506_0708_090a_0b0c);
        assert_eq!(s.get_byte().unwrap(), 0xfe);
        assert_eq!(s.get_string().unwrap(), "etc2");
        assert_eq!(s.remaining(), 0);
    }

    #[test]
    fn short_read_is_an_error() {
        let mut s = MemStream::from_bytes(vec![1, 2]);
        assert!(s.get_be32().is_err());
    }
}
