use bitflags::bitflags;

/// A rational number, used for frame rates and zone values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Fraction {
    pub numerator: u32,
    pub denominator: u32,
}

impl Fraction {
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self { numerator, denominator }
    }

    pub fn as_f32(&self) -> f32 {
        if self.denominator == 0 {
            return 0.0;
        }
        self.numerator as f32 / self.denominator as f32
    }
}

/// The type of a coded picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Intra coded, decodable on its own.
    I,
    /// Predicted from the previous picture.
    P,
    /// Bidirectionally predicted.
    B,
    /// Sprite (global motion compensated).
    S,
}

impl FrameType {
    pub(crate) fn code(self) -> i32 {
        match self {
            Self::I => 1,
            Self::P => 2,
            Self::B => 3,
            Self::S => 4,
        }
    }

    pub(crate) fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::I),
            2 => Some(Self::P),
            3 => Some(Self::B),
            4 => Some(Self::S),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelAspectRatio {
    /// 1:1, the VGA default.
    #[default]
    Square,
    /// 12:11, 4:3 PAL.
    Pal43,
    /// 10:11, 4:3 NTSC.
    Ntsc43,
    /// 16:11, 16:9 PAL.
    Pal169,
    /// 40:33, 16:9 NTSC.
    Ntsc169,
    Custom { width: u8, height: u8 },
}

impl PixelAspectRatio {
    pub fn width(&self) -> u32 {
        match self {
            Self::Square => 1,
            Self::Pal43 => 12,
            Self::Ntsc43 => 10,
            Self::Pal169 => 16,
            Self::Ntsc169 => 40,
            Self::Custom { width, .. } => *width as _,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Self::Square => 1,
            Self::Pal43 | Self::Ntsc43 | Self::Pal169 => 11,
            Self::Ntsc169 => 33,
            Self::Custom { height, .. } => *height as _,
        }
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            Self::Square => 1,
            Self::Pal43 => 2,
            Self::Ntsc43 => 3,
            Self::Pal169 => 4,
            Self::Ntsc169 => 5,
            Self::Custom { .. } => 15,
        }
    }

    /// Unknown codes are treated as square pixels.
    pub(crate) fn from_code(code: u8, width: u8, height: u8) -> Self {
        match code {
            2 => Self::Pal43,
            3 => Self::Ntsc43,
            4 => Self::Pal169,
            5 => Self::Ntsc169,
            15 if width > 0 && height > 0 => Self::Custom { width, height },
            _ => Self::Square,
        }
    }
}

/// Quantizer bounds for one frame type. Zero means the codec's default (2 and 31 respectively).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuantizerRange {
    pub min: u32,
    pub max: u32,
}

impl QuantizerRange {
    pub const DEFAULT_MIN: u32 = 2;
    pub const DEFAULT_MAX: u32 = 31;

    pub fn effective_min(&self) -> u32 {
        if self.min == 0 {
            Self::DEFAULT_MIN
        } else {
            self.min
        }
    }

    pub fn effective_max(&self) -> u32 {
        if self.max == 0 {
            Self::DEFAULT_MAX
        } else {
            self.max
        }
    }

    pub fn clamp(&self, quantizer: u32) -> u32 {
        quantizer.clamp(self.effective_min(), self.effective_max().max(self.effective_min()))
    }
}

/// B-frame quantizers are derived from the surrounding P-frames: `(avg * ratio + offset) / 100`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BFrameQuantizer {
    pub ratio: i32,
    pub offset: i32,
}

impl Default for BFrameQuantizer {
    fn default() -> Self {
        Self { ratio: 150, offset: 100 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneMode {
    /// The zone's value is the quantizer to use.
    Quantizer,
    /// The zone's value weights the rate control's bit allocation.
    Weight,
}

/// Overrides encoding parameters for every frame from `frame` up to the start of the next zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Zone {
    pub frame: u32,
    pub mode: ZoneMode,
    pub value: Fraction,
}

impl Zone {
    /// Finds the zone covering `frame`. Zones must be sorted by their start frame.
    pub(crate) fn find(zones: &[Zone], frame: u32) -> Option<Zone> {
        zones.iter().rev().find(|z| z.frame <= frame).copied()
    }
}

bitflags! {
    /// Post-processing and session control flags for a decode call.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DecoderFlags: u32 {
        const LOW_DELAY = 1 << 0;
        /// The previous picture should not be used as a reference.
        const DISCONTINUITY = 1 << 1;
        const DEBLOCK_LUMA = 1 << 2;
        const DEBLOCK_CHROMA = 1 << 3;
        const FILM_GRAIN = 1 << 4;
        const DERING_CHROMA = 1 << 5;
        const DERING_LUMA = 1 << 6;
    }

    /// Flags that apply to a whole encode session.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EncoderFlags: u32 {
        const PACKED = 1 << 0;
        const CLOSED_GOP = 1 << 1;
        /// Makes original images available so that per-frame statistics can be computed.
        const EXTRA_STATS_ENABLE = 1 << 2;
        const DIVX5_USER_DATA = 1 << 3;
    }

    /// Video object layer flags. These may only change on key frames.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct VolFlags: u32 {
        const MPEG_QUANTIZATION = 1 << 0;
        /// Compute per-plane SSE for every frame.
        const EXTRA_STATS = 1 << 1;
        const QUARTER_PEL = 1 << 2;
        const GMC = 1 << 3;
        const INTERLACING = 1 << 5;
    }

    /// Video object plane flags, applying to a single frame.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct VopFlags: u32 {
        const DEBUG = 1 << 0;
        const HALF_PEL = 1 << 1;
        const INTER_4V = 1 << 2;
        const TRELLIS_QUANT = 1 << 3;
        const CHROMA_OPT = 1 << 4;
        const CARTOON = 1 << 5;
        /// Code luma only.
        const GREYSCALE = 1 << 6;
        const HQ_AC_PRED = 1 << 7;
        const MODE_DECISION_RD = 1 << 8;
        const TOP_FIELD_FIRST = 1 << 9;
        const ALTERNATE_SCAN = 1 << 10;
        const FAST_MODE_DECISION_RD = 1 << 12;
        const RD_BVOP = 1 << 13;
        const RD_PSNRHVSM = 1 << 14;
    }

    /// Motion estimation flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MotionFlags: u32 {
        const ADVANCED_DIAMOND_16 = 1 << 0;
        const ADVANCED_DIAMOND_8 = 1 << 1;
        const USE_SQUARES_16 = 1 << 2;
        const USE_SQUARES_8 = 1 << 3;
        const HALF_PEL_REFINE_16 = 1 << 4;
        const HALF_PEL_REFINE_8 = 1 << 6;
        const QUARTER_PEL_REFINE_16 = 1 << 7;
        const QUARTER_PEL_REFINE_8 = 1 << 8;
        const GME_REFINE = 1 << 9;
        const EXTSEARCH_16 = 1 << 10;
        const EXTSEARCH_8 = 1 << 11;
        const CHROMA_PVOP = 1 << 12;
        const CHROMA_BVOP = 1 << 13;
        const FAST_REFINE_16 = 1 << 14;
        const FAST_REFINE_8 = 1 << 15;
        const EXTSEARCH_RD = 1 << 16;
        const HALF_PEL_REFINE_16_RD = 1 << 17;
        const HALF_PEL_REFINE_8_RD = 1 << 18;
        const QUARTER_PEL_REFINE_16_RD = 1 << 19;
        const QUARTER_PEL_REFINE_8_RD = 1 << 20;
        const CHECK_PREDICTION_RD = 1 << 21;
        const SKIP_DECISION_RD = 1 << 22;
        const DETECT_STATIC_MOTION = 1 << 24;
        const SKIP_DELTA_SEARCH = 1 << 26;
        const FAST_EQUALS = 1 << 27;
        const FAST_MODE_INTERPOLATE = 1 << 28;
        const BFRAME_EARLY_STOP = 1 << 29;
    }
}

/// Sum of squared errors per plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneErrors {
    pub y: u64,
    pub u: u64,
    pub v: u64,
}

/// Statistics describing a video object layer (sequence header).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolStats {
    pub interlacing: bool,
    pub width: u32,
    pub height: u32,
    pub pixel_aspect_ratio: PixelAspectRatio,
}

/// Statistics describing a decoded picture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameStats {
    pub frame_type: FrameType,
    pub upper_field_first: bool,
    /// The per-macroblock quantizers, if the codec exposed them in a usable layout.
    pub quantizers: Option<Vec<i32>>,
    pub quantizers_stride: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecoderStats {
    Vol(VolStats),
    Frame(FrameStats),
}

impl DecoderStats {
    pub fn frame_type(&self) -> Option<FrameType> {
        match self {
            Self::Vol(_) => None,
            Self::Frame(f) => Some(f.frame_type),
        }
    }
}

/// Statistics describing an encoded frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderStats {
    pub frame_type: FrameType,
    pub key_frame: bool,
    pub quantizer: u32,
    pub vol_flags: VolFlags,
    pub vop_flags: VopFlags,
    /// Total length of the frame in bytes.
    pub length: usize,
    /// Length of the headers in bytes.
    pub header_length: usize,
    pub intra_blocks: u32,
    pub inter_blocks: u32,
    pub uncoded_blocks: u32,
    /// Only computed when extra stats are enabled.
    pub sse: Option<PlaneErrors>,
}
