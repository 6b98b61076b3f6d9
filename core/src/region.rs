// Bounded window over another stream.
// Exposes the byte range [offset, offset + len) of an underlying
// device as its own seekable stream. Useful for handing a single
// partition's region to an engine that expects a whole device.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::{DeviceIo, XenonError};

pub struct RegionIo<D: DeviceIo> {
    inner: D,
    offset: u64,
    len: u64,
    position: u64,
}

impl<D: DeviceIo> RegionIo<D> {
    /// Window `inner` down to `len` bytes starting at `offset`. The
    /// region must lie inside the underlying stream.
    pub fn new(mut inner: D, offset: u64, len: u64) -> Result<Self, XenonError> {
        let inner_len = inner.len()?;
        if offset + len > inner_len {
            return Err(XenonError::Other(format!(
                "region {:#X}+{:#X} exceeds the {:#X}-byte stream",
                offset, len, inner_len
            )));
        }
        Ok(Self {
            inner,
            offset,
            len,
            position: 0,
        })
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    /// Bytes left between the position and the region end.
    fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.position)
    }
}

impl<D: DeviceIo> Read for RegionIo<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let take = (buf.len() as u64).min(self.remaining()) as usize;
        if take == 0 {
            return Ok(0);
        }
        self.inner
            .seek(SeekFrom::Start(self.offset + self.position))?;
        let read = self.inner.read(&mut buf[..take])?;
        self.position += read as u64;
        Ok(read)
    }
}

impl<D: DeviceIo> Write for RegionIo<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past the end of the region",
            ));
        }
        let take = (buf.len() as u64).min(self.remaining()) as usize;
        self.inner
            .seek(SeekFrom::Start(self.offset + self.position))?;
        self.inner.write_all(&buf[..take])?;
        self.position += take as u64;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<D: DeviceIo> Seek for RegionIo<D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the region",
            )),
        }
    }
}

impl<D: DeviceIo> DeviceIo for RegionIo<D> {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.len)
    }

    fn set_len(&mut self, _len: u64) -> Result<(), XenonError> {
        Err(XenonError::UnsupportedMode(
            "a region window cannot be resized".into(),
        ))
    }

    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync()
    }
}
