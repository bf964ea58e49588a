use crate::{
    codec::{Codec, EncodeRequest, EncoderBackend, EncoderCreate},
    dispatch::Dispatcher,
    error::{Error, Result},
    image::Image,
    plugin::PluginEntry,
    reference::ReferenceCodec,
    session::SessionState,
    types::{BFrameQuantizer, EncoderFlags, EncoderStats, Fraction, FrameType, MotionFlags, PixelAspectRatio, QuantizerRange, VolFlags, VopFlags, Zone},
};

/// The size of an output buffer large enough for any frame of the given dimensions.
pub fn buffer_size(width: u32, height: u32) -> usize {
    16384 + width as usize * height as usize * 30 * 3 / 8 + 120 + 8
}

fn default_num_threads() -> u32 {
    match std::thread::available_parallelism() {
        Ok(n) if n.get() > 2 => n.get() as u32 - 1,
        _ => 1,
    }
}

pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    /// Parameter overrides for ranges of frames, sorted by their first frame.
    pub zones: Vec<Zone>,
    /// Plugins run in this order for every phase.
    pub plugins: Vec<PluginEntry>,
    pub num_threads: u32,
    pub max_b_frames: u32,
    pub flags: EncoderFlags,
    /// Frames per second.
    pub frame_rate: Fraction,
    /// Zero means there's no limit.
    pub max_key_interval: u32,
    /// How similar to its predecessor a frame must be to be dropped, from 0 (never) to 100.
    pub frame_drop_ratio: u32,
    pub b_frame_quantizer: BFrameQuantizer,
    pub quantizer_i: QuantizerRange,
    pub quantizer_p: QuantizerRange,
    pub quantizer_b: QuantizerRange,
    pub start_frame_number: u32,
    pub num_slices: u32,
}

impl EncoderConfig {
    pub fn new(width: u32, height: u32, frame_rate: Fraction) -> Self {
        Self {
            width,
            height,
            zones: Vec::new(),
            plugins: Vec::new(),
            num_threads: default_num_threads(),
            max_b_frames: 2,
            flags: EncoderFlags::empty(),
            frame_rate,
            max_key_interval: 300,
            frame_drop_ratio: 0,
            b_frame_quantizer: BFrameQuantizer::default(),
            quantizer_i: QuantizerRange::default(),
            quantizer_p: QuantizerRange::default(),
            quantizer_b: QuantizerRange::default(),
            start_frame_number: 0,
            num_slices: 1,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::usage(format!("invalid dimensions {}x{}", self.width, self.height)));
        }
        if self.frame_rate.numerator == 0 {
            return Err(Error::usage("the frame rate must not be zero"));
        }
        if self.frame_drop_ratio > 100 {
            return Err(Error::usage(format!("frame drop ratio {} is above 100", self.frame_drop_ratio)));
        }
        if self.zones.windows(2).any(|w| w[0].frame > w[1].frame) {
            return Err(Error::usage("zones must be sorted by frame"));
        }
        for range in [self.quantizer_i, self.quantizer_p, self.quantizer_b] {
            if range.min > QuantizerRange::DEFAULT_MAX || range.max > QuantizerRange::DEFAULT_MAX {
                return Err(Error::usage(format!("quantizer range {}..={} exceeds 31", range.min, range.max)));
            }
            if range.min != 0 && range.max != 0 && range.min > range.max {
                return Err(Error::usage(format!("quantizer range {}..={} is empty", range.min, range.max)));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EncoderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EncoderConfig")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("zones", &self.zones)
            .field("plugins", &self.plugins)
            .field("frame_rate", &self.frame_rate)
            .field("max_key_interval", &self.max_key_interval)
            .finish_non_exhaustive()
    }
}

/// One frame to encode.
#[derive(Debug)]
pub struct EncoderFrame<'a, P = Vec<u8>> {
    pub input: &'a Image<P>,
    /// Grown to [`buffer_size`] if it's any smaller. Only the returned number of bytes are valid.
    pub output: &'a mut Vec<u8>,
    pub vol_flags: VolFlags,
    /// 64 entries, used with MPEG quantization.
    pub quant_intra_matrix: Option<&'a [u8]>,
    /// 64 entries, used with MPEG quantization.
    pub quant_inter_matrix: Option<&'a [u8]>,
    pub pixel_aspect_ratio: PixelAspectRatio,
    /// When non-zero, overrides the frame rate's denominator for this frame.
    pub frame_rate_denominator: u32,
    pub vop_flags: VopFlags,
    pub motion_flags: MotionFlags,
    /// `None` lets the encoder decide.
    pub frame_type: Option<FrameType>,
    /// Zero lets the encoder (or a rate control plugin) decide.
    pub quantizer: u32,
    pub b_frame_threshold: i32,
}

impl<'a, P> EncoderFrame<'a, P> {
    pub fn new(input: &'a Image<P>, output: &'a mut Vec<u8>) -> Self {
        Self {
            input,
            output,
            vol_flags: VolFlags::empty(),
            quant_intra_matrix: None,
            quant_inter_matrix: None,
            pixel_aspect_ratio: PixelAspectRatio::Square,
            frame_rate_denominator: 0,
            vop_flags: VopFlags::empty(),
            motion_flags: MotionFlags::empty(),
            frame_type: None,
            quantizer: 0,
            b_frame_threshold: 0,
        }
    }
}

fn quant_matrix(matrix: Option<&[u8]>) -> Result<Option<&[u8; 64]>> {
    matrix
        .map(|m| <&[u8; 64]>::try_from(m).map_err(|_| Error::usage(format!("quantization matrices need 64 entries, not {}", m.len()))))
        .transpose()
}

/// Encodes a sequence of images, running the configured plugins on every frame.
pub struct Encoder<C: Codec = ReferenceCodec> {
    handle: Option<C::Encoder>,
    dispatcher: Dispatcher,
    state: SessionState,
    width: u32,
    height: u32,
}

impl Encoder {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        Self::with_codec(&ReferenceCodec, config)
    }
}

impl<C: Codec> Encoder<C> {
    /// Creates the encoder, initializing every plugin. Fails with [`Error::PluginVeto`] if a
    /// plugin refuses to run.
    pub fn with_codec(codec: &C, config: EncoderConfig) -> Result<Self> {
        config.validate()?;
        let (mut dispatcher, plugins) = Dispatcher::new(config.plugins);
        let create = EncoderCreate {
            width: config.width,
            height: config.height,
            zones: &config.zones,
            plugins,
            num_threads: config.num_threads,
            max_b_frames: config.max_b_frames,
            flags: config.flags,
            frame_rate: config.frame_rate,
            max_key_interval: config.max_key_interval,
            frame_drop_ratio: config.frame_drop_ratio,
            b_frame_quantizer: config.b_frame_quantizer,
            quantizer_i: config.quantizer_i,
            quantizer_p: config.quantizer_p,
            quantizer_b: config.quantizer_b,
            start_frame_number: config.start_frame_number,
            num_slices: config.num_slices,
        };
        let handle = match codec.open_encoder(&create, &mut dispatcher) {
            Ok(handle) => handle,
            Err(e) => {
                return Err(match dispatcher.vetoed() {
                    Some(index) => Error::PluginVeto { index },
                    None => e.into(),
                })
            }
        };
        log::debug!("opened encoder ({}x{}, {} plugins)", config.width, config.height, create.plugins.len());
        Ok(Self {
            handle: Some(handle),
            dispatcher,
            state: SessionState::Open,
            width: config.width,
            height: config.height,
        })
    }

    /// Encodes a frame, returning the number of bytes written to the output buffer along with the
    /// frame's statistics. The statistics are `None` if the encoder dropped the frame.
    pub fn encode<P: AsRef<[u8]>>(&mut self, frame: EncoderFrame<'_, P>) -> Result<(usize, Option<EncoderStats>)> {
        self.state.check()?;
        let handle = self.handle.as_mut().ok_or(Error::Closed)?;

        let request = EncodeRequest {
            input: frame.input.native_input(self.width, self.height)?,
            vol_flags: frame.vol_flags,
            quant_intra_matrix: quant_matrix(frame.quant_intra_matrix)?,
            quant_inter_matrix: quant_matrix(frame.quant_inter_matrix)?,
            pixel_aspect_ratio: frame.pixel_aspect_ratio,
            frame_rate_denominator: frame.frame_rate_denominator,
            vop_flags: frame.vop_flags,
            motion_flags: frame.motion_flags,
            frame_type: frame.frame_type,
            quantizer: frame.quantizer,
            b_frame_threshold: frame.b_frame_threshold,
        };
        let size = buffer_size(self.width, self.height);
        if frame.output.len() < size {
            frame.output.resize(size, 0);
        }

        match handle.encode(&request, frame.output, &mut self.dispatcher) {
            Ok((length, stats)) => {
                log::trace!("encoded {} bytes ({:?})", length, stats.map(|s| s.frame_type));
                Ok((length, stats))
            }
            Err(e) => {
                let e = Error::from(e);
                log::error!("encoding failed: {}", e);
                self.state.poison(&e);
                Err(e)
            }
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Releases the codec, closing every plugin. This is done automatically when the encoder is
    /// dropped, and calling it more than once is harmless.
    pub fn close(&mut self) {
        if self.state.close() {
            if let Some(handle) = self.handle.take() {
                handle.close(&mut self.dispatcher);
            }
            log::debug!("closed encoder");
        }
    }
}

impl<C: Codec> Drop for Encoder<C> {
    fn drop(&mut self) {
        self.close();
    }
}
