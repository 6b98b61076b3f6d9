// Chained multi-file stream.
// Xbox 360 USB sticks split one logical FATX volume into 4 GiB data
// chunks; this composes the chunk files back into a single seekable
// stream of their summed length.

use std::io::{self, Read, Seek, SeekFrom, Write};

use log::debug;

use crate::{DeviceIo, XenonError};

pub struct ChainedIo {
    streams: Vec<Box<dyn DeviceIo>>,
    lengths: Vec<u64>,
    total_len: u64,
    position: u64,
}

impl ChainedIo {
    /// Compose `streams` in order. Lengths are sampled once, at
    /// construction; the sub-streams must not be resized afterwards.
    pub fn new(mut streams: Vec<Box<dyn DeviceIo>>) -> Result<Self, XenonError> {
        let mut lengths = Vec::with_capacity(streams.len());
        let mut total_len = 0u64;
        for stream in &mut streams {
            let len = stream.len()?;
            lengths.push(len);
            total_len += len;
        }
        debug!(
            "chained stream: {} sub-streams, {} bytes total",
            streams.len(),
            total_len
        );
        Ok(Self {
            streams,
            lengths,
            total_len,
            position: 0,
        })
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Map a virtual position to (sub-stream index, offset within it).
    /// Positions at or past the end map to `(stream_count, 0)`.
    fn locate(&self, position: u64) -> (usize, u64) {
        let mut remaining = position;
        for (index, &len) in self.lengths.iter().enumerate() {
            if remaining < len {
                return (index, remaining);
            }
            remaining -= len;
        }
        (self.lengths.len(), 0)
    }
}

impl Read for ChainedIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let (index, offset) = self.locate(self.position);
            if index >= self.streams.len() {
                break;
            }
            let available = self.lengths[index] - offset;
            let take = ((buf.len() - done) as u64).min(available) as usize;
            let stream = &mut self.streams[index];
            stream.seek(SeekFrom::Start(offset))?;
            stream.read_exact(&mut buf[done..done + take])?;
            self.position += take as u64;
            done += take;
        }
        Ok(done)
    }
}

impl Write for ChainedIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let (index, offset) = self.locate(self.position);
            if index >= self.streams.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write past the end of the chained stream",
                ));
            }
            let available = self.lengths[index] - offset;
            let take = ((buf.len() - done) as u64).min(available) as usize;
            let stream = &mut self.streams[index];
            stream.seek(SeekFrom::Start(offset))?;
            stream.write_all(&buf[done..done + take])?;
            self.position += take as u64;
            done += take;
        }
        Ok(done)
    }

    fn flush(&mut self) -> io::Result<()> {
        for stream in &mut self.streams {
            stream.flush()?;
        }
        Ok(())
    }
}

impl Seek for ChainedIo {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.total_len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the chained stream",
            )),
        }
    }
}

impl DeviceIo for ChainedIo {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.total_len)
    }

    fn set_len(&mut self, _len: u64) -> Result<(), XenonError> {
        Err(XenonError::UnsupportedMode(
            "a chained stream cannot be resized".into(),
        ))
    }

    fn sync(&mut self) -> io::Result<()> {
        for stream in &mut self.streams {
            stream.flush()?;
            stream.sync()?;
        }
        Ok(())
    }
}
