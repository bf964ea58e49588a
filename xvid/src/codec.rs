//! The boundary between the session engine and a codec implementation.
//!
//! A codec is opened once per session, stepped many times and closed exactly once. Every step is
//! synchronous and a handle never sees two calls at the same time. Encoders call back into the
//! session's plugins through the [`PluginHost`] they are lent on every call.

use crate::{
    error::Error,
    image::{ImageRef, NativeOutput},
    plugin::{BuiltinPlugin, PluginClose, PluginFlags, PluginInit},
    types::{
        BFrameQuantizer, DecoderFlags, EncoderFlags, EncoderStats, Fraction, FrameType, MotionFlags, PixelAspectRatio, PlaneErrors,
        QuantizerRange, VolFlags, VopFlags, Zone,
    },
};

/// A raw codec return code. Negative values are errors.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CodecError(pub i32);

impl CodecError {
    pub const FAIL: Self = Self(-1);
    pub const MEMORY: Self = Self(-2);
    pub const FORMAT: Self = Self(-3);
    pub const VERSION: Self = Self(-4);
    pub const END: Self = Self(-5);
}

impl std::error::Error for CodecError {}

impl std::fmt::Debug for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "CodecError({} /* {} */)", self.0, self)
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Self::FAIL => f.write_str("general fault"),
            Self::MEMORY => f.write_str("memory allocation error"),
            Self::FORMAT => f.write_str("file format error"),
            Self::VERSION => f.write_str("version not supported"),
            Self::END => f.write_str("end of stream reached"),
            Self(code) => write!(f, "unknown error (code = {code})"),
        }
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::MEMORY => Error::MemoryAllocation,
            CodecError::FORMAT => Error::Format,
            CodecError::VERSION => Error::VersionMismatch,
            CodecError::END => Error::EndOfStream,
            _ => Error::GeneralFault,
        }
    }
}

/// A codec implementation capable of opening decode and encode sessions.
pub trait Codec {
    type Decoder: DecoderBackend;
    type Encoder: EncoderBackend;

    fn open_decoder(&self, create: &DecoderCreate) -> Result<Self::Decoder, CodecError>;

    /// Opens an encoder. Custom plugins must be initialized through `host` before this returns, and
    /// must receive their info callbacks in registration order.
    fn open_encoder(&self, create: &EncoderCreate<'_>, host: &mut dyn PluginHost) -> Result<Self::Encoder, CodecError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecoderCreate {
    /// Zero if unknown. The stream's own headers take precedence.
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    pub num_threads: u32,
}

#[derive(Debug)]
pub struct DecodeRequest<'a> {
    pub output: NativeOutput<'a>,
    pub flags: DecoderFlags,
    pub brightness: i32,
}

/// What a single decode step produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedUnit {
    /// More input is needed before anything can be produced.
    Nothing,
    Vol {
        flags: VolFlags,
        width: u32,
        height: u32,
        pixel_aspect_ratio: PixelAspectRatio,
    },
    Vop {
        frame_type: FrameType,
        flags: VopFlags,
        quantizers: Vec<i32>,
        quantizers_stride: usize,
    },
}

pub trait DecoderBackend: Send {
    /// Decodes at most one unit from `input`, returning the number of bytes used. `input` is
    /// `None` once the stream is exhausted, in which case delayed pictures are emitted and
    /// [`CodecError::END`] signals that nothing is left.
    fn decode(&mut self, input: Option<&[u8]>, request: &mut DecodeRequest<'_>) -> Result<(usize, DecodedUnit), CodecError>;

    /// The most recently decoded picture, in the codec's own buffers.
    fn internal_image(&self) -> Option<ImageRef<'_>>;

    fn close(self)
    where
        Self: Sized;
}

/// Identifies a custom plugin when the codec calls back into the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PluginToken(pub(crate) usize);

impl PluginToken {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Debug)]
pub enum PluginSlot {
    /// Handled entirely inside the codec.
    Builtin(BuiltinPlugin),
    /// Forwarded to the session's plugin host.
    Custom(PluginToken),
}

#[derive(Clone, Debug)]
pub struct EncoderCreate<'a> {
    pub width: u32,
    pub height: u32,
    pub zones: &'a [Zone],
    pub plugins: Vec<PluginSlot>,
    pub num_threads: u32,
    pub max_b_frames: u32,
    pub flags: EncoderFlags,
    pub frame_rate: Fraction,
    pub max_key_interval: u32,
    pub frame_drop_ratio: u32,
    pub b_frame_quantizer: BFrameQuantizer,
    pub quantizer_i: QuantizerRange,
    pub quantizer_p: QuantizerRange,
    pub quantizer_b: QuantizerRange,
    pub start_frame_number: u32,
    pub num_slices: u32,
}

#[derive(Clone, Debug)]
pub struct EncodeRequest<'a> {
    pub input: ImageRef<'a>,
    pub vol_flags: VolFlags,
    pub quant_intra_matrix: Option<&'a [u8; 64]>,
    pub quant_inter_matrix: Option<&'a [u8; 64]>,
    pub pixel_aspect_ratio: PixelAspectRatio,
    /// Overrides the frame rate denominator for this frame when non-zero.
    pub frame_rate_denominator: u32,
    pub vop_flags: VopFlags,
    pub motion_flags: MotionFlags,
    /// `None` lets the codec decide.
    pub frame_type: Option<FrameType>,
    /// Zero lets the codec (or a rate control plugin) decide.
    pub quantizer: u32,
    pub b_frame_threshold: i32,
}

pub trait EncoderBackend: Send {
    /// Encodes one frame into `output`, returning the number of bytes written and, unless the
    /// frame was dropped or delayed, its statistics.
    fn encode(&mut self, request: &EncodeRequest<'_>, output: &mut [u8], host: &mut dyn PluginHost) -> Result<(usize, Option<EncoderStats>), CodecError>;

    /// Releases the codec. Every plugin that was successfully created is destroyed.
    fn close(self, host: &mut dyn PluginHost)
    where
        Self: Sized;
}

/// The per-call structure a codec shares with its plugins. Scalars are owned; tables and images
/// point into codec memory for the duration of one callback.
#[derive(Debug)]
pub struct PluginCallData<'a> {
    pub zone: Option<Zone>,
    pub width: u32,
    pub height: u32,
    pub mb_width: u32,
    pub mb_height: u32,
    pub frame_rate: Fraction,
    pub quantizer_i: QuantizerRange,
    pub quantizer_p: QuantizerRange,
    pub quantizer_b: QuantizerRange,
    pub reference: ImageRef<'a>,
    pub current: ImageRef<'a>,
    pub original: Option<ImageRef<'a>>,
    pub frame_number: u32,
    pub frame_type: Option<FrameType>,
    pub quantizer: u32,
    pub diff_quantizers: Option<&'a mut [i32]>,
    pub diff_quantizers_stride: usize,
    pub lambda: Option<&'a mut [f32]>,
    pub vol_flags: VolFlags,
    pub vop_flags: VopFlags,
    pub motion_flags: MotionFlags,
    pub b_frame_quantizer: BFrameQuantizer,
    pub stats: Option<EncoderStats>,
    /// Computed when a plugin asks for PSNR, regardless of the extra stats flags.
    pub sse: Option<PlaneErrors>,
}

/// Receives plugin callbacks from a codec.
pub trait PluginHost {
    /// Asks the next custom plugin, in registration order, which extra data it needs.
    fn info(&mut self) -> PluginFlags;

    /// Returns false if the plugin refuses to run, which must abort encoder creation.
    fn create(&mut self, token: PluginToken, init: &PluginInit<'_>) -> bool;

    fn before(&mut self, token: PluginToken, data: &mut PluginCallData<'_>);

    fn frame(&mut self, token: PluginToken, data: &mut PluginCallData<'_>);

    fn after(&mut self, token: PluginToken, data: &mut PluginCallData<'_>);

    /// `close` is `None` when the encoder is torn down before it was fully created.
    fn destroy(&mut self, token: PluginToken, close: Option<&PluginClose>);
}
