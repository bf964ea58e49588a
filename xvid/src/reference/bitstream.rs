//! Unit framing for the reference bitstream.
//!
//! Every unit starts with a four byte start code (`00 00 01` followed by the unit type), then a
//! big-endian payload length, then the payload. Units are zero-padded to a multiple of eight bytes.

use crate::codec::CodecError;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

pub const START_CODE_PREFIX: [u8; 3] = [0, 0, 1];
pub const VOL_START_CODE: u8 = 0x20;
pub const VOP_START_CODE: u8 = 0xb6;

const HEADER_LEN: usize = 8;
const UNIT_ALIGNMENT: usize = 8;
const MAX_PAYLOAD_LEN: usize = 1 << 28;

fn padded(len: usize) -> usize {
    (len + UNIT_ALIGNMENT - 1) / UNIT_ALIGNMENT * UNIT_ALIGNMENT
}

/// Writes units into a caller-provided buffer. Running out of room is reported as
/// [`CodecError::MEMORY`].
pub struct UnitWriter<'a> {
    cursor: Cursor<&'a mut [u8]>,
}

impl<'a> UnitWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { cursor: Cursor::new(buf) }
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    /// Starts a unit, returning its offset for [`UnitWriter::end_unit`].
    pub fn begin_unit(&mut self, code: u8) -> Result<usize, CodecError> {
        let start = self.position();
        self.put_bytes(&START_CODE_PREFIX)?;
        self.put_u8(code)?;
        self.put_u32(0)?;
        Ok(start)
    }

    pub fn end_unit(&mut self, start: usize) -> Result<(), CodecError> {
        let end = self.position();
        let payload_len = end - start - HEADER_LEN;
        let padding = padded(end - start) - (end - start);
        self.put_bytes(&[0; UNIT_ALIGNMENT][..padding])?;
        BigEndian::write_u32(&mut self.cursor.get_mut()[start + 4..start + HEADER_LEN], payload_len as u32);
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> Result<(), CodecError> {
        self.cursor.write_u8(v).map_err(|_| CodecError::MEMORY)
    }

    pub fn put_u16(&mut self, v: u16) -> Result<(), CodecError> {
        self.cursor.write_u16::<BigEndian>(v).map_err(|_| CodecError::MEMORY)
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), CodecError> {
        self.cursor.write_u32::<BigEndian>(v).map_err(|_| CodecError::MEMORY)
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> Result<(), CodecError> {
        self.cursor.write_all(v).map_err(|_| CodecError::MEMORY)
    }

    /// LEB128.
    pub fn put_varint(&mut self, mut v: u32) -> Result<(), CodecError> {
        while v >= 0x80 {
            self.put_u8(v as u8 | 0x80)?;
            v >>= 7;
        }
        self.put_u8(v as u8)
    }

    pub fn put_signed(&mut self, v: i32) -> Result<(), CodecError> {
        self.put_varint(((v << 1) ^ (v >> 31)) as u32)
    }
}

/// Reads fields out of a unit's payload. Reading past the end is a format error.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        self.buf.read_u8().map_err(|_| CodecError::FORMAT)
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        self.buf.read_u16::<BigEndian>().map_err(|_| CodecError::FORMAT)
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        self.buf.read_u32::<BigEndian>().map_err(|_| CodecError::FORMAT)
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < len {
            return Err(CodecError::FORMAT);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn varint(&mut self) -> Result<u32, CodecError> {
        let mut v = 0u32;
        for shift in (0..35).step_by(7) {
            let byte = self.u8()?;
            v |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
        }
        Err(CodecError::FORMAT)
    }

    pub fn signed(&mut self) -> Result<i32, CodecError> {
        let v = self.varint()?;
        Ok((v >> 1) as i32 ^ -((v & 1) as i32))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Parsed<'a> {
    /// A complete unit, `len` bytes long including its header and padding.
    Unit { code: u8, payload: &'a [u8], len: usize },
    /// Bytes that don't belong to any unit.
    Skip(usize),
    /// The next unit isn't completely buffered yet.
    Incomplete,
}

/// Finds the next unit in `input`.
pub fn parse_unit(input: &[u8]) -> Result<Parsed<'_>, CodecError> {
    match memchr::memmem::find(input, &START_CODE_PREFIX) {
        Some(0) => {}
        Some(offset) => return Ok(Parsed::Skip(offset)),
        // keep a possible partial start code at the end
        None => {
            let skip = input.len().saturating_sub(START_CODE_PREFIX.len() - 1);
            return Ok(if skip > 0 { Parsed::Skip(skip) } else { Parsed::Incomplete });
        }
    }
    if input.len() < HEADER_LEN {
        return Ok(Parsed::Incomplete);
    }
    let code = input[3];
    let payload_len = BigEndian::read_u32(&input[4..HEADER_LEN]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        log::warn!("unit of type {:#04x} claims a {} byte payload", code, payload_len);
        return Err(CodecError::FORMAT);
    }
    let len = padded(HEADER_LEN + payload_len);
    if input.len() < len {
        return Ok(Parsed::Incomplete);
    }
    Ok(Parsed::Unit {
        code,
        payload: &input[HEADER_LEN..HEADER_LEN + payload_len],
        len,
    })
}
