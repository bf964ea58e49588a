use crate::{
    codec::{Codec, DecodeRequest, DecodedUnit, DecoderBackend, DecoderCreate},
    error::{Error, Result},
    image::{ColorSpace, Image, ImageRef},
    reference::ReferenceCodec,
    session::SessionState,
    stream::{StreamBuffer, DEFAULT_CAPACITY},
    types::{DecoderFlags, DecoderStats, FrameStats, VolFlags, VolStats, VopFlags},
};
use std::io::Read;

/// The smallest stream buffer a decoder will run with.
const MIN_BUFFER_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    /// The expected width. Leave as zero to detect it from the stream.
    pub width: u32,
    /// The expected height. Leave as zero to detect it from the stream.
    pub height: u32,
    pub fourcc: u32,
    /// Zero lets the codec decide.
    pub num_threads: u32,
    /// How much of the stream to hold in memory at once.
    pub buffer_capacity: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            fourcc: 0,
            num_threads: 0,
            buffer_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Where and how to decode the next picture.
#[derive(Debug)]
pub struct DecoderFrame<'a> {
    /// Empty planes are allocated for the stream's dimensions and zero strides are filled in. With
    /// [`ColorSpace::Internal`], the picture is returned as [`Decoded::internal`] instead.
    pub output: &'a mut Image,
    pub flags: DecoderFlags,
    pub brightness: i32,
}

impl<'a> DecoderFrame<'a> {
    pub fn new(output: &'a mut Image) -> Self {
        Self {
            output,
            flags: DecoderFlags::empty(),
            brightness: 0,
        }
    }
}

/// One unit decoded from the stream.
#[derive(Debug)]
pub struct Decoded<'d> {
    /// The number of bytes of input used to produce this unit.
    pub length: usize,
    pub stats: DecoderStats,
    /// The decoded picture in the decoder's own buffers, when decoding to [`ColorSpace::Internal`].
    /// It borrows the decoder, so it must be dropped before the next call:
    ///
    /// ```compile_fail
    /// # use xvid::{ColorSpace, Decoder, DecoderConfig, DecoderFrame, Image};
    /// # fn main() -> xvid::Result<()> {
    /// let mut decoder = Decoder::new(DecoderConfig::default(), std::io::empty())?;
    /// let mut output = Image::new(ColorSpace::Internal);
    /// let first = decoder.decode(DecoderFrame::new(&mut output))?;
    /// let second = decoder.decode(DecoderFrame::new(&mut output))?;
    /// drop((first, second));
    /// # Ok(())
    /// # }
    /// ```
    pub internal: Option<ImageRef<'d>>,
}

/// Decodes a stream of units read from `R`.
///
/// Bytes are pulled from the reader as needed, so the decoder can be fed from files, sockets or
/// pipes without knowing the stream's length ahead of time.
pub struct Decoder<R, C: Codec = ReferenceCodec> {
    handle: Option<C::Decoder>,
    stream: StreamBuffer<R>,
    state: SessionState,
    width: u32,
    height: u32,
}

impl<R: Read> Decoder<R> {
    pub fn new(config: DecoderConfig, input: R) -> Result<Self> {
        Self::with_codec(&ReferenceCodec, config, input)
    }
}

impl<R: Read, C: Codec> Decoder<R, C> {
    pub fn with_codec(codec: &C, config: DecoderConfig, input: R) -> Result<Self> {
        if config.buffer_capacity < MIN_BUFFER_CAPACITY {
            return Err(Error::usage(format!(
                "the buffer capacity must be at least {MIN_BUFFER_CAPACITY} bytes (got {})",
                config.buffer_capacity
            )));
        }
        let handle = codec.open_decoder(&DecoderCreate {
            width: config.width,
            height: config.height,
            fourcc: config.fourcc,
            num_threads: config.num_threads,
        })?;
        log::debug!("opened decoder ({}x{}, buffer = {})", config.width, config.height, config.buffer_capacity);
        Ok(Self {
            handle: Some(handle),
            stream: StreamBuffer::new(input, config.buffer_capacity),
            state: SessionState::Open,
            width: config.width,
            height: config.height,
        })
    }

    /// Decodes the next unit. Returns `None` once the stream has been fully decoded.
    ///
    /// Errors other than usage errors are permanent: every later call returns the same error.
    pub fn decode(&mut self, frame: DecoderFrame<'_>) -> Result<Option<Decoded<'_>>> {
        self.state.check()?;
        if self.state.is_finished() {
            return Ok(None);
        }
        let handle = self.handle.as_mut().ok_or(Error::Closed)?;

        let internal = frame.output.color_space == ColorSpace::Internal;
        let mut request = DecodeRequest {
            output: frame.output.native_output(self.width, self.height)?,
            flags: frame.flags,
            brightness: frame.brightness,
        };

        let result = self.stream.next_unit(|input| {
            let (used, unit) = handle.decode(input, &mut request)?;
            Ok((used, (unit != DecodedUnit::Nothing).then_some(unit)))
        });
        let (length, unit) = match result {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                log::debug!("reached the end of the stream");
                self.state.finish();
                return Ok(None);
            }
            Err(e) => {
                log::error!("decoding failed: {}", e);
                self.state.poison(&e);
                return Err(e);
            }
        };

        let stats = match unit {
            DecodedUnit::Vol {
                flags,
                width,
                height,
                pixel_aspect_ratio,
            } => {
                log::debug!("stream dimensions are {}x{}", width, height);
                self.width = width;
                self.height = height;
                DecoderStats::Vol(VolStats {
                    interlacing: flags.contains(VolFlags::INTERLACING),
                    width,
                    height,
                    pixel_aspect_ratio,
                })
            }
            DecodedUnit::Vop {
                frame_type,
                flags,
                mut quantizers,
                quantizers_stride,
            } => {
                let mb_width = ((self.width + 15) / 16) as usize;
                let mb_height = ((self.height + 15) / 16) as usize;
                let quantizers = if quantizers.is_empty() {
                    None
                } else if quantizers_stride != mb_width || quantizers.len() < mb_width * mb_height {
                    log::warn!(
                        "ignoring quantizer map with stride {} for {} macroblocks per row",
                        quantizers_stride,
                        mb_width
                    );
                    None
                } else {
                    quantizers.truncate(mb_width * mb_height);
                    Some(quantizers)
                };
                DecoderStats::Frame(FrameStats {
                    frame_type,
                    upper_field_first: flags.contains(VopFlags::TOP_FIELD_FIRST),
                    quantizers,
                    quantizers_stride,
                })
            }
            DecodedUnit::Nothing => {
                let e = Error::invariant("the decode loop returned an empty unit");
                self.state.poison(&e);
                return Err(e);
            }
        };
        log::trace!("decoded {:?} from {} bytes", stats.frame_type(), length);

        let internal = match (internal, &stats) {
            (true, DecoderStats::Frame(_)) => handle.internal_image(),
            _ => None,
        };
        Ok(Some(Decoded { length, stats, internal }))
    }
}

impl<R, C: Codec> Decoder<R, C> {
    /// The current picture dimensions, as configured or as last announced by the stream.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Returns true once the whole stream has been decoded.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Releases the codec. This is done automatically when the decoder is dropped, and calling it
    /// more than once is harmless.
    pub fn close(&mut self) {
        if self.state.close() {
            if let Some(handle) = self.handle.take() {
                handle.close();
            }
            log::debug!("closed decoder");
        }
    }
}

impl<R, C: Codec> Drop for Decoder<R, C> {
    fn drop(&mut self) {
        self.close();
    }
}
