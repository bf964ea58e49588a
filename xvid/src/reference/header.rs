use super::bitstream::{PayloadReader, UnitWriter, VOL_START_CODE, VOP_START_CODE};
use crate::{
    codec::CodecError,
    types::{Fraction, FrameType, PixelAspectRatio, VolFlags, VopFlags},
};

/// The only bitstream version this codec reads and writes.
pub const VERSION: u8 = 1;

const VOP_TOP_FIELD_FIRST: u8 = 1 << 0;
const VOP_GREYSCALE: u8 = 1 << 1;

/// Sequence parameters, sent ahead of the first picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolHeader {
    pub width: u32,
    pub height: u32,
    pub flags: VolFlags,
    pub pixel_aspect_ratio: PixelAspectRatio,
    pub frame_rate: Fraction,
}

impl VolHeader {
    pub fn write(&self, w: &mut UnitWriter<'_>) -> Result<(), CodecError> {
        let start = w.begin_unit(VOL_START_CODE)?;
        w.put_u8(VERSION)?;
        w.put_u16(self.width as u16)?;
        w.put_u16(self.height as u16)?;
        w.put_u32(self.flags.bits())?;
        w.put_u8(self.pixel_aspect_ratio.code())?;
        w.put_u8(self.pixel_aspect_ratio.width() as u8)?;
        w.put_u8(self.pixel_aspect_ratio.height() as u8)?;
        w.put_u32(self.frame_rate.numerator)?;
        w.put_u32(self.frame_rate.denominator)?;
        w.end_unit(start)
    }

    pub fn read(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = PayloadReader::new(payload);
        let version = r.u8()?;
        if version != VERSION {
            log::warn!("unsupported bitstream version {}", version);
            return Err(CodecError::VERSION);
        }
        let width = r.u16()? as u32;
        let height = r.u16()? as u32;
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            log::warn!("invalid picture dimensions {}x{}", width, height);
            return Err(CodecError::FORMAT);
        }
        let flags = VolFlags::from_bits_truncate(r.u32()?);
        let (code, par_width, par_height) = (r.u8()?, r.u8()?, r.u8()?);
        Ok(Self {
            width,
            height,
            flags,
            pixel_aspect_ratio: PixelAspectRatio::from_code(code, par_width, par_height),
            frame_rate: Fraction::new(r.u32()?, r.u32()?),
        })
    }
}

/// Picture parameters. The per-macroblock quantizers follow the header in the same unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VopHeader {
    pub frame_type: FrameType,
    pub quantizer: u8,
    pub top_field_first: bool,
    pub greyscale: bool,
}

impl VopHeader {
    /// Starts a VOP unit, returning its offset for [`UnitWriter::end_unit`].
    pub fn write(&self, w: &mut UnitWriter<'_>, quantizers: &[u8]) -> Result<usize, CodecError> {
        let start = w.begin_unit(VOP_START_CODE)?;
        w.put_u8(self.frame_type.code() as u8)?;
        w.put_u8(self.quantizer)?;
        let mut flags = 0;
        if self.top_field_first {
            flags |= VOP_TOP_FIELD_FIRST;
        }
        if self.greyscale {
            flags |= VOP_GREYSCALE;
        }
        w.put_u8(flags)?;
        w.put_bytes(quantizers)?;
        Ok(start)
    }

    pub fn read<'a>(r: &mut PayloadReader<'a>, mb_count: usize) -> Result<(Self, &'a [u8]), CodecError> {
        let frame_type = FrameType::from_code(r.u8()? as i32).ok_or(CodecError::FORMAT)?;
        let quantizer = r.u8()?;
        let flags = r.u8()?;
        let quantizers = r.bytes(mb_count)?;
        if quantizers.iter().any(|&q| q == 0 || q > 31) {
            return Err(CodecError::FORMAT);
        }
        Ok((
            Self {
                frame_type,
                quantizer,
                top_field_first: flags & VOP_TOP_FIELD_FIRST != 0,
                greyscale: flags & VOP_GREYSCALE != 0,
            },
            quantizers,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reference::bitstream::{parse_unit, Parsed};

    fn vol() -> VolHeader {
        VolHeader {
            width: 320,
            height: 240,
            flags: VolFlags::INTERLACING,
            pixel_aspect_ratio: PixelAspectRatio::Custom { width: 12, height: 11 },
            frame_rate: Fraction::new(30000, 1001),
        }
    }

    #[test]
    fn test_vol() {
        let mut buf = [0u8; 64];
        let mut w = UnitWriter::new(&mut buf);
        vol().write(&mut w).unwrap();
        let len = w.position();
        match parse_unit(&buf[..len]).unwrap() {
            Parsed::Unit { code, payload, .. } => {
                assert_eq!(code, VOL_START_CODE);
                assert_eq!(VolHeader::read(payload), Ok(vol()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_vol_version() {
        let mut payload = [0u8; 20];
        payload[0] = VERSION + 1;
        assert_eq!(VolHeader::read(&payload), Err(CodecError::VERSION));
        payload[0] = VERSION;
        assert_eq!(VolHeader::read(&payload), Err(CodecError::FORMAT));
    }

    #[test]
    fn test_vop_quantizers() {
        let payload = [2, 4, VOP_TOP_FIELD_FIRST, 4, 5, 6];
        let (header, quantizers) = VopHeader::read(&mut PayloadReader::new(&payload), 3).unwrap();
        assert_eq!(header.frame_type, FrameType::P);
        assert!(header.top_field_first && !header.greyscale);
        assert_eq!(quantizers, &[4, 5, 6]);

        let payload = [1, 4, 0, 4, 0];
        assert_eq!(VopHeader::read(&mut PayloadReader::new(&payload), 2).map(|_| ()), Err(CodecError::FORMAT));
        let payload = [9, 4, 0, 4];
        assert_eq!(VopHeader::read(&mut PayloadReader::new(&payload), 1).map(|_| ()), Err(CodecError::FORMAT));
    }
}
