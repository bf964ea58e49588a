//! Plugins observe and steer the encoder one frame at a time.
//!
//! Each frame passes through three phases. `before` runs ahead of any analysis and may pick the
//! frame type, quantizer and coding flags. `frame` runs once the frame type is known and may adjust
//! the quantizer along with the per-macroblock tables it asked for. `after` observes the result.
//! What a phase may change is encoded in the type it receives, so a plugin can't write a field
//! outside of its phase:
//!
//! ```compile_fail
//! # use xvid::{AfterFrame, Plugin};
//! struct Meddler;
//! impl Plugin for Meddler {
//!     fn after(&mut self, frame: &AfterFrame<'_>) {
//!         frame.quantizer = 31;
//!     }
//! }
//! ```
//!
//! ```compile_fail
//! # use xvid::{DuringFrame, Plugin};
//! struct Meddler;
//! impl Plugin for Meddler {
//!     fn frame(&mut self, frame: &mut DuringFrame<'_>) {
//!         frame.frame_number = 0;
//!     }
//! }
//! ```

use crate::{
    image::ImageRef,
    types::{BFrameQuantizer, EncoderStats, Fraction, FrameType, MotionFlags, PlaneErrors, QuantizerRange, VolFlags, VopFlags, Zone},
};
use bitflags::bitflags;
use std::{ops::Deref, path::PathBuf};

bitflags! {
    /// Optional data a plugin asks the encoder to provide.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PluginFlags: u32 {
        /// A copy of the original image, visible after encoding.
        const ORIGINAL = 1 << 0;
        /// Per-plane error statistics, visible after encoding.
        const PSNR = 1 << 1;
        /// The per-macroblock delta quantizer table, writable while encoding.
        const DIFF_QUANTIZERS = 1 << 2;
        /// The per-macroblock lambda table, writable while encoding.
        const LAMBDA = 1 << 3;
    }
}

/// Given to plugins when the encoder is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PluginInit<'a> {
    pub zones: &'a [Zone],
    pub width: u32,
    pub height: u32,
    pub mb_width: u32,
    pub mb_height: u32,
    pub frame_rate: Fraction,
}

/// Given to plugins when the encoder is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PluginClose {
    /// The number of frames encoded over the whole session.
    pub num_frames: u32,
}

/// Per-frame data every phase can read.
#[derive(Clone, Debug)]
pub struct FrameData<'a> {
    pub zone: Option<Zone>,
    pub width: u32,
    pub height: u32,
    pub mb_width: u32,
    pub mb_height: u32,
    pub frame_rate: Fraction,
    pub quantizer_i: QuantizerRange,
    pub quantizer_p: QuantizerRange,
    pub quantizer_b: QuantizerRange,
    pub frame_number: u32,
    /// The previously reconstructed image.
    pub reference: ImageRef<'a>,
    /// The image being encoded, or once encoding is done, its reconstruction.
    pub current: ImageRef<'a>,
    pub b_frame_quantizer: BFrameQuantizer,
    pub diff_quantizers_stride: usize,
}

/// What a plugin sees before the encoder analyzes a frame.
#[derive(Debug)]
pub struct BeforeFrame<'a> {
    pub(crate) data: FrameData<'a>,
    /// `None` lets the encoder decide.
    pub frame_type: Option<FrameType>,
    /// Zero lets the encoder decide.
    pub quantizer: u32,
    pub vol_flags: VolFlags,
    pub vop_flags: VopFlags,
    pub motion_flags: MotionFlags,
}

impl<'a> Deref for BeforeFrame<'a> {
    type Target = FrameData<'a>;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

/// What a plugin sees while a frame is being encoded.
#[derive(Debug)]
pub struct DuringFrame<'a> {
    pub(crate) data: FrameData<'a>,
    pub frame_type: Option<FrameType>,
    pub quantizer: u32,
    pub(crate) vol_flags: VolFlags,
    pub(crate) vop_flags: VopFlags,
    pub(crate) motion_flags: MotionFlags,
    pub(crate) diff_quantizers: Option<&'a mut [i32]>,
    pub(crate) lambda: Option<&'a mut [f32]>,
}

impl<'a> DuringFrame<'a> {
    pub fn vol_flags(&self) -> VolFlags {
        self.vol_flags
    }

    pub fn vop_flags(&self) -> VopFlags {
        self.vop_flags
    }

    pub fn motion_flags(&self) -> MotionFlags {
        self.motion_flags
    }

    /// Quantizer offsets for each macroblock, `mb_width` entries per `diff_quantizers_stride`. Only
    /// present if the plugin asked for [`PluginFlags::DIFF_QUANTIZERS`].
    pub fn diff_quantizers(&mut self) -> Option<&mut [i32]> {
        self.diff_quantizers.as_deref_mut()
    }

    /// Six rate-distortion weights per macroblock. Only present if the plugin asked for
    /// [`PluginFlags::LAMBDA`].
    pub fn lambda(&mut self) -> Option<&mut [f32]> {
        self.lambda.as_deref_mut()
    }
}

impl<'a> Deref for DuringFrame<'a> {
    type Target = FrameData<'a>;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

/// What a plugin sees once a frame has been encoded. Nothing here flows back into the encoder.
#[derive(Debug)]
pub struct AfterFrame<'a> {
    pub(crate) data: FrameData<'a>,
    pub frame_type: Option<FrameType>,
    pub quantizer: u32,
    pub vol_flags: VolFlags,
    pub vop_flags: VopFlags,
    pub motion_flags: MotionFlags,
    /// Only present if the plugin asked for [`PluginFlags::ORIGINAL`].
    pub original: Option<ImageRef<'a>>,
    pub diff_quantizers: Option<&'a [i32]>,
    pub stats: Option<EncoderStats>,
    pub(crate) sse: Option<PlaneErrors>,
}

impl<'a> AfterFrame<'a> {
    /// The peak signal-to-noise ratio of each plane, in decibels. Only present if the plugin asked
    /// for [`PluginFlags::PSNR`].
    pub fn psnr(&self) -> Option<[f64; 3]> {
        let sse = self.sse?;
        let luma = self.width as f64 * self.height as f64;
        Some([psnr(sse.y, luma), psnr(sse.u, luma / 4.0), psnr(sse.v, luma / 4.0)])
    }
}

impl<'a> Deref for AfterFrame<'a> {
    type Target = FrameData<'a>;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

pub(crate) fn psnr(sse: u64, samples: f64) -> f64 {
    if sse == 0 || samples <= 0.0 {
        return 99.99;
    }
    10.0 * (255.0 * 255.0 * samples / sse as f64).log10()
}

/// A policy module hooked into the encoder. Every method has a default that does nothing.
pub trait Plugin: Send {
    /// Declares which optional data the plugin needs.
    fn info(&self) -> PluginFlags {
        PluginFlags::empty()
    }

    /// Returning false prevents the encoder from being created.
    fn init(&mut self, _init: &PluginInit<'_>) -> bool {
        true
    }

    fn before(&mut self, _frame: &mut BeforeFrame<'_>) {}

    fn frame(&mut self, _frame: &mut DuringFrame<'_>) {}

    fn after(&mut self, _frame: &AfterFrame<'_>) {}

    fn close(&mut self, _close: &PluginClose) {}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinglePassConfig {
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    pub reaction_delay_factor: u32,
    pub averaging_period: u32,
    pub buffer: u32,
}

impl SinglePassConfig {
    pub fn new(bitrate: u32) -> Self {
        Self {
            bitrate,
            reaction_delay_factor: 16,
            averaging_period: 100,
            buffer: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TwoPassSecondConfig {
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    /// The statistics written by the first pass.
    pub path: PathBuf,
    /// Extra bits given to key frames, as a percentage.
    pub key_frame_boost: u32,
    /// Bytes per frame the container adds on top of the bitstream.
    pub container_frame_overhead: u32,
}

impl TwoPassSecondConfig {
    pub fn new(bitrate: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            bitrate,
            path: path.into(),
            key_frame_boost: 10,
            container_frame_overhead: 100,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskingMethod {
    Luminance,
    Variance,
}

/// Plugins implemented by the codec itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuiltinPlugin {
    /// One-pass rate control.
    SinglePass(SinglePassConfig),
    /// Records per-frame statistics to a file. The file is overwritten, and failures to write it
    /// are only logged.
    TwoPassFirst { path: PathBuf },
    /// Distributes the bitrate using statistics recorded by a first pass.
    TwoPassSecond(TwoPassSecondConfig),
    /// Adjusts macroblock quantizers to the image content.
    AdaptiveQuantization(MaskingMethod),
    /// Logs the PSNR of every frame.
    Psnr,
}

impl BuiltinPlugin {
    pub fn info(&self) -> PluginFlags {
        match self {
            Self::AdaptiveQuantization(_) => PluginFlags::DIFF_QUANTIZERS,
            Self::Psnr => PluginFlags::ORIGINAL | PluginFlags::PSNR,
            _ => PluginFlags::empty(),
        }
    }
}

/// An entry in an encoder's plugin chain.
pub enum PluginEntry {
    Builtin(BuiltinPlugin),
    Custom(Box<dyn Plugin>),
}

impl PluginEntry {
    pub fn custom<P: Plugin + 'static>(plugin: P) -> Self {
        Self::Custom(Box::new(plugin))
    }
}

impl From<BuiltinPlugin> for PluginEntry {
    fn from(plugin: BuiltinPlugin) -> Self {
        Self::Builtin(plugin)
    }
}

impl std::fmt::Debug for PluginEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Builtin(plugin) => f.debug_tuple("Builtin").field(plugin).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_psnr() {
        assert_eq!(psnr(0, 100.0), 99.99);
        let db = psnr(100, 100.0);
        assert!((db - 48.13).abs() < 0.01, "psnr = {}", db);
    }

    #[test]
    fn test_builtin_info() {
        assert_eq!(BuiltinPlugin::Psnr.info(), PluginFlags::ORIGINAL | PluginFlags::PSNR);
        assert!(BuiltinPlugin::SinglePass(SinglePassConfig::new(1000)).info().is_empty());
        let entry: PluginEntry = BuiltinPlugin::Psnr.into();
        assert_eq!(format!("{:?}", entry), "Builtin(Psnr)");
    }
}
