use alloc::vec::Vec;

pub trait RawVideoFrame<S> {
    /// The samples that make up the frame's image. Typically this consists of 3 Y/U/V planes of
    /// `u8`s, but any format that the encoder supports can be used.
    fn samples(&self, plane: usize) -> &[S];
}

/// Lets the caller force the type of an individual frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EncodedFrameType {
    /// The encoder decides.
    #[default]
    Auto,
    /// The frame must be independently decodable.
    Key,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedVideoFrame {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

pub struct VideoEncoderOutput<F> {
    /// The frame that was given to the encoder.
    pub raw_frame: F,
    /// The encoded frame. This is `None` if the encoder decided to drop the frame.
    pub encoded_frame: Option<EncodedVideoFrame>,
}

/// Implements basic video encoding behavior. Raw frames are handed back along with their encoded
/// counterparts so that any metadata they carry survives the trip through the encoder.
///
/// Typical usage should look like this:
///
/// ```
/// # use av_traits::{EncodedFrameType, RawVideoFrame, VideoEncoder};
/// fn encode<S, E>(mut source: S, mut encoder: E) -> Result<(), E::Error>
///     where S: Iterator<Item = Box<dyn RawVideoFrame<u8>>>,
///     E: VideoEncoder<RawVideoFrame = Box<dyn RawVideoFrame<u8>>>
/// {
///     while let Some(frame) = source.next() {
///         if let Some(output) = encoder.encode(frame, EncodedFrameType::Auto)? {
///             // do something with output.encoded_frame
///         }
///     }
///
///     while let Some(output) = encoder.flush()? {
///         // do something with output.encoded_frame
///     }
///
///     Ok(())
/// }
/// ```
pub trait VideoEncoder {
    type Error;
    type RawVideoFrame;

    /// Sends a frame to the encoder. This may block while the encoder performs encoding.
    ///
    /// `None` may be returned at the start of a session to allow for delayed encoder output (e.g.
    /// for B-frames or lookahead RC).
    ///
    /// Because output may be delayed, the returned frame is not necessarily the same as the input
    /// frame.
    fn encode(&mut self, input: Self::RawVideoFrame, frame_type: EncodedFrameType) -> Result<Option<VideoEncoderOutput<Self::RawVideoFrame>>, Self::Error>;

    /// Indicates to the encoder that no more input will be provided and it should emit any delayed
    /// frames. This should be invoked until no more frames are returned.
    fn flush(&mut self) -> Result<Option<VideoEncoderOutput<Self::RawVideoFrame>>, Self::Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_video_encoder_object_safety() {
        let _e: *const dyn VideoEncoder<Error = (), RawVideoFrame = ()>;
    }

    #[test]
    fn test_default_frame_type() {
        assert_eq!(EncodedFrameType::default(), EncodedFrameType::Auto);
    }
}
