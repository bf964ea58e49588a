//! Decode and encode sessions for MPEG-4 Part 2 style video.
//!
//! A [`Decoder`] pulls bytes from any [`std::io::Read`] and hands back one unit at a time. An
//! [`Encoder`] turns images into bitstream while a chain of [`Plugin`]s observes and steers each
//! frame. Both run on top of a [`Codec`] implementation, by default the pure Rust
//! [`ReferenceCodec`].

pub mod codec;
pub mod decoder;
pub mod dispatch;
pub mod encoder;
pub mod error;
pub mod image;
pub mod plugin;
pub mod reference;
pub mod session;
pub mod stream;
pub mod types;
pub mod video_encoder;

pub use codec::{Codec, CodecError, PluginHost};
pub use decoder::{Decoded, Decoder, DecoderConfig, DecoderFrame};
pub use encoder::{buffer_size, Encoder, EncoderConfig, EncoderFrame};
pub use error::{Error, Result};
pub use image::{ColorSpace, Image, ImageRef};
pub use plugin::{
    AfterFrame, BeforeFrame, BuiltinPlugin, DuringFrame, FrameData, MaskingMethod, Plugin, PluginClose, PluginEntry, PluginFlags, PluginInit,
    SinglePassConfig, TwoPassSecondConfig,
};
pub use reference::ReferenceCodec;
pub use session::SessionState;
pub use types::*;
pub use video_encoder::XvidVideoEncoder;
