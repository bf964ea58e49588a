use crate::{
    codec::CodecError,
    error::{Error, Result},
};
use std::io::{self, Read};

pub const DEFAULT_CAPACITY: usize = 4 * 1024 * 1024;

/// Codecs are only ever offered input in multiples of this many bytes.
const ALIGNMENT: usize = 8;

/// Reads until `buf` is full or the reader reports the end of its data.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Feeds a codec from a byte source of unknown length.
///
/// Bytes in `buffer[position..length]` have been read but not consumed. The buffer is compacted and
/// topped up once more than half of it has been consumed, so memory use stays fixed no matter how
/// long the stream is.
pub struct StreamBuffer<R> {
    reader: R,
    buffer: Box<[u8]>,
    position: usize,
    length: usize,
    started: bool,
    eof: bool,
}

impl<R: Read> StreamBuffer<R> {
    pub fn new(reader: R, capacity: usize) -> Self {
        Self {
            reader,
            buffer: vec![0; capacity].into_boxed_slice(),
            position: 0,
            length: 0,
            started: false,
            eof: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    fn remaining(&self) -> usize {
        self.length - self.position
    }

    fn top_up(&mut self) -> io::Result<()> {
        let n = read_full(&mut self.reader, &mut self.buffer[self.length..])?;
        self.length += n;
        if self.length < self.buffer.len() {
            self.eof = true;
        }
        log::trace!("read {} bytes (buffered = {}, eof = {})", n, self.remaining(), self.eof);
        Ok(())
    }

    fn refill(&mut self) -> io::Result<()> {
        self.buffer.copy_within(self.position..self.length, 0);
        self.length -= self.position;
        self.position = 0;
        if !self.eof {
            self.top_up()?;
        }
        Ok(())
    }

    fn advance(&mut self, used: usize, offered: usize) -> Result<()> {
        if used > offered {
            return Err(Error::invariant(format!("codec consumed {used} bytes but was only given {offered}")));
        }
        self.position += used;
        Ok(())
    }

    /// Steps the codec until it produces something, returning what it produced along with the total
    /// number of bytes consumed to get there. `Ok(None)` means the stream is exhausted.
    ///
    /// `step` receives `None` once no input is left, and should return `CodecError::END` once
    /// nothing more can be flushed.
    pub fn next_unit<T, F>(&mut self, mut step: F) -> Result<Option<(usize, T)>>
    where
        F: FnMut(Option<&[u8]>) -> Result<(usize, Option<T>), CodecError>,
    {
        if !self.started {
            self.started = true;
            self.top_up()?;
        }

        let mut total = 0;
        loop {
            if self.eof && self.remaining() <= 1 {
                let (used, unit) = match step(None) {
                    Err(CodecError::END) => return Ok(None),
                    r => r?,
                };
                self.advance(used, 0)?;
                total += used;
                match unit {
                    Some(unit) => return Ok(Some((total, unit))),
                    None => continue,
                }
            }

            if !self.eof && self.position > self.buffer.len() / 2 {
                self.refill()?;
            }

            let offered = self.remaining() / ALIGNMENT * ALIGNMENT;
            if offered == 0 {
                if self.eof {
                    log::debug!("discarding {} trailing bytes", self.remaining());
                    self.position = self.length;
                } else {
                    self.refill()?;
                }
                continue;
            }

            let (used, unit) = match step(Some(&self.buffer[self.position..self.position + offered])) {
                Err(CodecError::END) => {
                    log::debug!("codec ended the stream with {} bytes left", self.remaining());
                    return Ok(None);
                }
                r => r?,
            };
            self.advance(used, offered)?;
            total += used;
            if let Some(unit) = unit {
                return Ok(Some((total, unit)));
            }

            if used == 0 {
                if self.eof {
                    log::warn!("discarding {} bytes of truncated input", self.remaining());
                    self.position = self.length;
                } else if self.position == 0 && self.length == self.buffer.len() {
                    log::error!("stream unit exceeds the {} byte buffer", self.buffer.len());
                    return Err(Error::Format);
                } else {
                    self.refill()?;
                }
            }
        }
    }
}
