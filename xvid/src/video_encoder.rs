use crate::{
    codec::Codec,
    encoder::{Encoder, EncoderConfig, EncoderFrame},
    error::{Error, Result},
    image::{ColorSpace, Image},
    reference::ReferenceCodec,
    types::FrameType,
};
use av_traits::{EncodedFrameType, EncodedVideoFrame, RawVideoFrame, VideoEncoder, VideoEncoderOutput};
use std::marker::PhantomData;

/// Adapts an [`Encoder`] to the generic [`VideoEncoder`] interface. Frames must be 4:2:0 planar
/// with tightly packed rows.
pub struct XvidVideoEncoder<F, C: Codec = ReferenceCodec> {
    encoder: Encoder<C>,
    output: Vec<u8>,
    _frame: PhantomData<fn(F) -> F>,
}

impl<F> XvidVideoEncoder<F> {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        Self::with_codec(&ReferenceCodec, config)
    }
}

impl<F, C: Codec> XvidVideoEncoder<F, C> {
    pub fn with_codec(codec: &C, config: EncoderConfig) -> Result<Self> {
        Ok(Self {
            encoder: Encoder::with_codec(codec, config)?,
            output: Vec::new(),
            _frame: PhantomData,
        })
    }
}

impl<F: RawVideoFrame<u8>, C: Codec> VideoEncoder for XvidVideoEncoder<F, C> {
    type Error = Error;
    type RawVideoFrame = F;

    fn encode(&mut self, input: F, frame_type: EncodedFrameType) -> Result<Option<VideoEncoderOutput<F>>> {
        let (length, stats) = {
            let image = Image {
                color_space: ColorSpace::Planar,
                vertical_flip: false,
                planes: vec![input.samples(0), input.samples(1), input.samples(2)],
                strides: vec![],
            };
            let mut frame = EncoderFrame::new(&image, &mut self.output);
            frame.frame_type = match frame_type {
                EncodedFrameType::Key => Some(FrameType::I),
                EncodedFrameType::Auto => None,
            };
            self.encoder.encode(frame)?
        };
        let encoded_frame = stats.map(|stats| EncodedVideoFrame {
            data: self.output[..length].to_vec(),
            is_keyframe: stats.key_frame,
        });
        Ok(Some(VideoEncoderOutput {
            raw_frame: input,
            encoded_frame,
        }))
    }

    /// Frames are never delayed, so there's nothing to flush.
    fn flush(&mut self) -> Result<Option<VideoEncoderOutput<F>>> {
        Ok(None)
    }
}
