// Device I/O abstraction shared by every storage engine.
// A device is any seekable byte stream: a plain file, an in-memory
// buffer, or a chained sequence of data files.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use crate::XenonError;

/// Seekable byte stream with explicit length control.
///
/// Engines hold exactly one of these per open volume and serialize all
/// access through it; nothing here is safe to share across threads.
pub trait DeviceIo: Read + Write + Seek {
    /// Total length of the stream in bytes.
    fn len(&mut self) -> io::Result<u64>;

    /// Grow or shrink the stream to `len` bytes.
    fn set_len(&mut self, len: u64) -> Result<(), XenonError>;

    /// Push buffered writes all the way to the backing store.
    fn sync(&mut self) -> io::Result<()>;
}

impl<T: DeviceIo + ?Sized> DeviceIo for Box<T> {
    fn len(&mut self) -> io::Result<u64> {
        (**self).len()
    }

    fn set_len(&mut self, len: u64) -> Result<(), XenonError> {
        (**self).set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }
}

impl<T: DeviceIo + ?Sized> DeviceIo for &mut T {
    fn len(&mut self) -> io::Result<u64> {
        (**self).len()
    }

    fn set_len(&mut self, len: u64) -> Result<(), XenonError> {
        (**self).set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }
}

impl DeviceIo for File {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<(), XenonError> {
        File::set_len(self, len)?;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

/// Plain in-memory stream, mainly for tests and scratch volumes.
pub type MemoryIo = Cursor<Vec<u8>>;

impl DeviceIo for Cursor<Vec<u8>> {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<(), XenonError> {
        self.get_mut().resize(len as usize, 0);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Byte buffer backed by an anonymous temporary file.
///
/// The backing file is already unlinked from the filesystem, so dropping
/// the buffer leaves nothing behind no matter how the process exits.
pub struct BufferIo {
    file: File,
}

impl BufferIo {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            file: tempfile::tempfile()?,
        })
    }

    pub fn with_data(data: &[u8]) -> io::Result<Self> {
        let mut buffer = Self::new()?;
        buffer.file.write_all(data)?;
        buffer.file.seek(SeekFrom::Start(0))?;
        Ok(buffer)
    }

    /// Snapshot the whole buffer without disturbing the position.
    pub fn to_vec(&mut self) -> io::Result<Vec<u8>> {
        let saved = self.file.stream_position()?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut out = Vec::new();
        self.file.read_to_end(&mut out)?;
        self.file.seek(SeekFrom::Start(saved))?;
        Ok(out)
    }
}

impl Read for BufferIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for BufferIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for BufferIo {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl DeviceIo for BufferIo {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<(), XenonError> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}
