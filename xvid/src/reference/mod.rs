//! A small, self-contained codec used by default.
//!
//! Pictures are 4:2:0 and coded macroblock by macroblock, either against mid-grey (I frames) or
//! against the previous reconstruction (P frames), with a uniform quantizer per macroblock. It has
//! none of the efficiency of a real MPEG-4 implementation, but it exercises every part of the
//! session engine: sequence headers, per-macroblock quantizers, skipped macroblocks, frame drops
//! and plugins.

mod bitstream;
mod decoder;
mod encoder;
mod header;
mod picture;
mod ratecontrol;

use crate::codec::{Codec, CodecError, DecoderCreate, EncoderCreate, PluginHost};

pub use decoder::ReferenceDecoder;
pub use encoder::ReferenceEncoder;

/// The number of macroblocks per row and column.
pub(crate) fn mb_dimensions(width: u32, height: u32) -> (usize, usize) {
    (((width + 15) / 16) as usize, ((height + 15) / 16) as usize)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceCodec;

impl Codec for ReferenceCodec {
    type Decoder = ReferenceDecoder;
    type Encoder = ReferenceEncoder;

    fn open_decoder(&self, create: &DecoderCreate) -> Result<Self::Decoder, CodecError> {
        Ok(ReferenceDecoder::new(create))
    }

    fn open_encoder(&self, create: &EncoderCreate<'_>, host: &mut dyn PluginHost) -> Result<Self::Encoder, CodecError> {
        ReferenceEncoder::open(create, host)
    }
}
