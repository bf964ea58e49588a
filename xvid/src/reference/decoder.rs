use super::{
    bitstream::{parse_unit, Parsed, PayloadReader, VOL_START_CODE, VOP_START_CODE},
    header::{VolHeader, VopHeader},
    mb_dimensions,
    picture::{Picture, PictureCoding},
};
use crate::{
    codec::{CodecError, DecodeRequest, DecodedUnit, DecoderBackend, DecoderCreate},
    image::{ColorSpace, ImageRef, NativeOutput},
    types::{FrameType, VopFlags},
};

/// Decodes the reference bitstream. Pictures are never reordered, so nothing is ever delayed.
pub struct ReferenceDecoder {
    vol: Option<VolHeader>,
    reference: Option<Picture>,
    spare: Option<Picture>,
}

impl ReferenceDecoder {
    pub(super) fn new(create: &DecoderCreate) -> Self {
        log::debug!("opening reference decoder (expecting {}x{})", create.width, create.height);
        Self {
            vol: None,
            reference: None,
            spare: None,
        }
    }

    fn decode_vol(&mut self, payload: &[u8]) -> Result<DecodedUnit, CodecError> {
        let vol = VolHeader::read(payload)?;
        if self.vol.map(|v| (v.width, v.height)) != Some((vol.width, vol.height)) {
            self.reference = None;
            self.spare = None;
        }
        self.vol = Some(vol);
        Ok(DecodedUnit::Vol {
            flags: vol.flags,
            width: vol.width,
            height: vol.height,
            pixel_aspect_ratio: vol.pixel_aspect_ratio,
        })
    }

    fn decode_vop(&mut self, payload: &[u8], request: &mut DecodeRequest<'_>) -> Result<DecodedUnit, CodecError> {
        let Some(vol) = self.vol else {
            log::warn!("picture before any sequence header");
            return Err(CodecError::FORMAT);
        };
        let (mb_width, mb_height) = mb_dimensions(vol.width, vol.height);
        let mut r = PayloadReader::new(payload);
        let (header, quantizers) = VopHeader::read(&mut r, mb_width * mb_height)?;
        let reference = match header.frame_type {
            FrameType::I => None,
            _ => match &self.reference {
                Some(reference) => Some(reference),
                None => {
                    log::warn!("predicted picture without a reference");
                    return Err(CodecError::FORMAT);
                }
            },
        };

        let mut picture = self.spare.take().unwrap_or_else(|| Picture::new(vol.width, vol.height, 0));
        let coding = PictureCoding {
            mb_width,
            mb_height,
            quantizers,
            reference,
            greyscale: header.greyscale,
        };
        coding.decode(&mut r, &mut picture)?;
        if r.remaining() > 0 {
            log::trace!("ignoring {} trailing bytes in picture", r.remaining());
        }
        if let NativeOutput::Planes(output) = &mut request.output {
            picture.export(output, request.brightness)?;
        }
        self.spare = self.reference.replace(picture);

        let mut flags = VopFlags::empty();
        flags.set(VopFlags::TOP_FIELD_FIRST, header.top_field_first);
        flags.set(VopFlags::GREYSCALE, header.greyscale);
        Ok(DecodedUnit::Vop {
            frame_type: header.frame_type,
            flags,
            quantizers: quantizers.iter().map(|&q| q as i32).collect(),
            quantizers_stride: mb_width,
        })
    }
}

impl DecoderBackend for ReferenceDecoder {
    fn decode(&mut self, input: Option<&[u8]>, request: &mut DecodeRequest<'_>) -> Result<(usize, DecodedUnit), CodecError> {
        let Some(input) = input else {
            return Err(CodecError::END);
        };
        match parse_unit(input)? {
            Parsed::Incomplete => Ok((0, DecodedUnit::Nothing)),
            Parsed::Skip(n) => {
                log::trace!("skipping {} bytes between units", n);
                Ok((n, DecodedUnit::Nothing))
            }
            Parsed::Unit { code, payload, len } => {
                let unit = match code {
                    VOL_START_CODE => self.decode_vol(payload)?,
                    VOP_START_CODE => self.decode_vop(payload, request)?,
                    _ => {
                        log::debug!("ignoring unit of type {:#04x}", code);
                        DecodedUnit::Nothing
                    }
                };
                Ok((len, unit))
            }
        }
    }

    fn internal_image(&self) -> Option<ImageRef<'_>> {
        self.reference.as_ref().map(|picture| picture.as_image(ColorSpace::Internal))
    }

    fn close(self) {
        log::debug!("closing reference decoder");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        image::ImageMut,
        reference::bitstream::UnitWriter,
        types::{DecoderFlags, Fraction, PixelAspectRatio, VolFlags},
    };

    fn vol(width: u32, height: u32) -> VolHeader {
        VolHeader {
            width,
            height,
            flags: VolFlags::empty(),
            pixel_aspect_ratio: PixelAspectRatio::Square,
            frame_rate: Fraction::new(25, 1),
        }
    }

    fn request<'a>(output: NativeOutput<'a>) -> DecodeRequest<'a> {
        DecodeRequest {
            output,
            flags: DecoderFlags::empty(),
            brightness: 0,
        }
    }

    fn intra_stream(value: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let mut w = UnitWriter::new(&mut buf);
        vol(16, 16).write(&mut w).unwrap();
        let header = VopHeader {
            frame_type: FrameType::I,
            quantizer: 2,
            top_field_first: false,
            greyscale: false,
        };
        let source = Picture::new(16, 16, value);
        let start = header.write(&mut w, &[2]).unwrap();
        let coding = PictureCoding {
            mb_width: 1,
            mb_height: 1,
            quantizers: &[2],
            reference: None,
            greyscale: false,
        };
        coding.encode(&mut w, &source, &mut Picture::new(16, 16, 0)).unwrap();
        w.end_unit(start).unwrap();
        let len = w.position();
        buf.truncate(len);
        buf
    }

    #[test]
    fn test_decode() {
        let stream = intra_stream(200);
        let mut decoder = ReferenceDecoder::new(&DecoderCreate::default());
        let (used, unit) = decoder.decode(Some(&stream), &mut request(NativeOutput::None)).unwrap();
        assert!(matches!(unit, DecodedUnit::Vol { width: 16, height: 16, .. }));
        assert!(decoder.internal_image().is_none());

        let mut planes = vec![vec![0u8; 256], vec![0u8; 64], vec![0u8; 64]];
        let output = ImageMut {
            color_space: ColorSpace::Planar,
            vertical_flip: false,
            planes: planes.iter_mut().map(|p| p.as_mut_slice()).collect(),
            strides: vec![16, 8, 8],
        };
        let (rest, unit) = decoder.decode(Some(&stream[used..]), &mut request(NativeOutput::Planes(output))).unwrap();
        assert_eq!(used + rest, stream.len());
        assert_eq!(
            unit,
            DecodedUnit::Vop {
                frame_type: FrameType::I,
                flags: VopFlags::empty(),
                quantizers: vec![2],
                quantizers_stride: 1
            }
        );
        assert_eq!(planes[0], vec![200; 256]);
        assert_eq!(planes[1], vec![200; 64]);
        assert_eq!(decoder.internal_image().unwrap().planes[0], &[200u8; 256][..]);

        assert_eq!(decoder.decode(None, &mut request(NativeOutput::None)), Err(CodecError::END));
    }

    #[test]
    fn test_picture_without_vol() {
        let stream = intra_stream(10);
        let mut decoder = ReferenceDecoder::new(&DecoderCreate::default());
        let vol_len = match parse_unit(&stream).unwrap() {
            Parsed::Unit { len, .. } => len,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            decoder.decode(Some(&stream[vol_len..]), &mut request(NativeOutput::Internal)),
            Err(CodecError::FORMAT)
        );
    }

    #[test]
    fn test_unknown_units_are_skipped() {
        let mut buf = [0u8; 16];
        let mut w = UnitWriter::new(&mut buf);
        let start = w.begin_unit(0xb2).unwrap();
        w.put_bytes(b"user").unwrap();
        w.end_unit(start).unwrap();
        let mut decoder = ReferenceDecoder::new(&DecoderCreate::default());
        assert_eq!(decoder.decode(Some(&buf), &mut request(NativeOutput::None)), Ok((16, DecodedUnit::Nothing)));
    }
}
