//! Plugins the reference codec runs itself.

use super::picture::MB_SIZE;
use crate::{
    codec::{CodecError, PluginCallData},
    image::ImageRef,
    plugin::{psnr, BuiltinPlugin, MaskingMethod, PluginInit, SinglePassConfig, TwoPassSecondConfig},
    types::{FrameType, QuantizerRange, ZoneMode},
};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

const STATS_HEADER: &str = "# xvid two-pass statistics v1";

pub(super) trait NativePlugin: Send {
    fn before(&mut self, _data: &mut PluginCallData<'_>) {}

    fn frame(&mut self, _data: &mut PluginCallData<'_>) {}

    fn after(&mut self, _data: &mut PluginCallData<'_>) {}

    fn destroy(&mut self, _num_frames: u32) {}
}

pub(super) fn create(plugin: &BuiltinPlugin, init: &PluginInit<'_>) -> Result<Box<dyn NativePlugin>, CodecError> {
    Ok(match plugin {
        BuiltinPlugin::SinglePass(config) => Box::new(SinglePass::new(config, init)),
        BuiltinPlugin::TwoPassFirst { path } => Box::new(TwoPassFirst::new(path)),
        BuiltinPlugin::TwoPassSecond(config) => Box::new(TwoPassSecond::new(config, init)?),
        BuiltinPlugin::AdaptiveQuantization(method) => Box::new(AdaptiveQuantization { method: *method }),
        BuiltinPlugin::Psnr => Box::new(PsnrLog),
    })
}

fn frames_per_second(init: &PluginInit<'_>) -> f64 {
    match init.frame_rate.as_f32() as f64 {
        fps if fps > 0.0 => fps,
        _ => 25.0,
    }
}

fn range_for(data: &PluginCallData<'_>) -> QuantizerRange {
    match data.frame_type {
        Some(FrameType::I) => data.quantizer_i,
        Some(FrameType::B) => data.quantizer_b,
        _ => data.quantizer_p,
    }
}

fn frame_type_char(frame_type: FrameType) -> char {
    match frame_type {
        FrameType::I => 'i',
        FrameType::P => 'p',
        FrameType::B => 'b',
        FrameType::S => 's',
    }
}

fn frame_type_from_char(c: &str) -> Option<FrameType> {
    Some(match c {
        "i" => FrameType::I,
        "p" => FrameType::P,
        "b" => FrameType::B,
        "s" => FrameType::S,
        _ => return None,
    })
}

/// Feedback rate control: frames larger than the target raise the quantizer and vice versa.
struct SinglePass {
    target: f64,
    reaction_delay: f64,
    averaging_period: f64,
    buffer: f64,
    quantizer: f64,
    average_length: f64,
    overflow: f64,
}

impl SinglePass {
    fn new(config: &SinglePassConfig, init: &PluginInit<'_>) -> Self {
        let target = config.bitrate as f64 / 8.0 / frames_per_second(init);
        Self {
            target,
            reaction_delay: config.reaction_delay_factor.max(1) as f64,
            averaging_period: config.averaging_period.max(1) as f64,
            buffer: config.buffer.max(1) as f64,
            quantizer: 4.0,
            average_length: target,
            overflow: 0.0,
        }
    }
}

impl NativePlugin for SinglePass {
    fn before(&mut self, data: &mut PluginCallData<'_>) {
        if data.quantizer != 0 {
            return;
        }
        let weight = match data.zone {
            Some(zone) if zone.mode == ZoneMode::Weight && zone.value.as_f32() > 0.0 => zone.value.as_f32() as f64,
            _ => 1.0,
        };
        data.quantizer = range_for(data).clamp((self.quantizer / weight).round() as u32);
    }

    fn after(&mut self, data: &mut PluginCallData<'_>) {
        let Some(stats) = data.stats else {
            return;
        };
        let length = stats.length as f64;
        self.average_length += (length - self.average_length) / self.averaging_period;
        self.overflow += length - self.target;
        let overflow = (self.overflow / (self.target * self.buffer).max(1.0)).clamp(-0.5, 0.5);
        let error = self.average_length / self.target.max(1.0) - 1.0 + overflow;
        self.quantizer = (self.quantizer * (1.0 + error / self.reaction_delay)).clamp(1.0, 31.0);
    }
}

/// Records what every frame cost so a second pass can distribute the bitrate.
struct TwoPassFirst {
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl TwoPassFirst {
    fn new(path: &Path) -> Self {
        let file = File::create(path).and_then(|file| {
            let mut file = BufWriter::new(file);
            writeln!(file, "{}", STATS_HEADER)?;
            Ok(file)
        });
        let file = match file {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!("unable to create {}: {}", path.display(), e);
                None
            }
        };
        Self {
            path: path.to_path_buf(),
            file,
        }
    }

    fn write_failed(&mut self, e: io::Error) {
        log::warn!("unable to write {}: {}", self.path.display(), e);
        self.file = None;
    }
}

impl NativePlugin for TwoPassFirst {
    fn before(&mut self, data: &mut PluginCallData<'_>) {
        if data.quantizer == 0 {
            data.quantizer = QuantizerRange::DEFAULT_MIN;
        }
    }

    fn after(&mut self, data: &mut PluginCallData<'_>) {
        let (Some(file), Some(stats)) = (&mut self.file, data.stats) else {
            return;
        };
        let result = writeln!(
            file,
            "{} {} {} {}",
            frame_type_char(stats.frame_type),
            stats.quantizer,
            stats.length,
            stats.header_length
        );
        if let Err(e) = result {
            self.write_failed(e);
        }
    }

    fn destroy(&mut self, num_frames: u32) {
        if let Some(mut file) = self.file.take() {
            match file.flush() {
                Ok(()) => log::debug!("wrote statistics for {} frames to {}", num_frames, self.path.display()),
                Err(e) => self.write_failed(e),
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FirstPassFrame {
    frame_type: FrameType,
    quantizer: u32,
    length: usize,
}

fn parse_stats_line(line: &str) -> Option<FirstPassFrame> {
    let mut fields = line.split_whitespace();
    Some(FirstPassFrame {
        frame_type: frame_type_from_char(fields.next()?)?,
        quantizer: fields.next()?.parse().ok()?,
        length: fields.next()?.parse().ok()?,
    })
}

fn read_stats(path: &Path) -> io::Result<Vec<FirstPassFrame>> {
    let contents = std::fs::read_to_string(path)?;
    let mut frames = Vec::new();
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
        match parse_stats_line(line) {
            Some(frame) => frames.push(frame),
            None => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("malformed line: {}", line))),
        }
    }
    Ok(frames)
}

/// Scales every frame's first pass quantizer so that the total size meets the target bitrate.
struct TwoPassSecond {
    frames: Vec<FirstPassFrame>,
    scale: f64,
    key_frame_boost: f64,
    next: usize,
}

impl TwoPassSecond {
    fn new(config: &TwoPassSecondConfig, init: &PluginInit<'_>) -> Result<Self, CodecError> {
        let frames = match read_stats(&config.path) {
            Ok(frames) if !frames.is_empty() => frames,
            Ok(_) => {
                log::error!("{} doesn't contain any frames", config.path.display());
                return Err(CodecError::FAIL);
            }
            Err(e) => {
                log::error!("unable to read first pass statistics from {}: {}", config.path.display(), e);
                return Err(CodecError::FAIL);
            }
        };
        let count = frames.len() as f64;
        let first_pass: f64 = frames.iter().map(|f| f.length as f64).sum();
        let target = config.bitrate as f64 / 8.0 * count / frames_per_second(init) - config.container_frame_overhead as f64 * count;
        Ok(Self {
            scale: target.max(count) / first_pass.max(1.0),
            frames,
            key_frame_boost: config.key_frame_boost as f64 / 100.0,
            next: 0,
        })
    }
}

impl NativePlugin for TwoPassSecond {
    fn before(&mut self, data: &mut PluginCallData<'_>) {
        let frame = self.frames.get(self.next).copied();
        self.next += 1;
        let Some(frame) = frame else {
            return;
        };
        if data.frame_type.is_none() && frame.frame_type == FrameType::I {
            data.frame_type = Some(FrameType::I);
        }
        if data.quantizer == 0 {
            let boost = match frame.frame_type {
                FrameType::I => 1.0 + self.key_frame_boost,
                _ => 1.0,
            };
            data.quantizer = range_for(data).clamp((frame.quantizer as f64 / (self.scale * boost)).round() as u32);
        }
    }
}

/// The mean and variance of a macroblock's luma samples.
fn luma_statistics(image: &ImageRef<'_>, width: usize, height: usize, mb_x: usize, mb_y: usize) -> (f64, f64) {
    let (x0, y0) = (mb_x * MB_SIZE, mb_y * MB_SIZE);
    let (x1, y1) = ((x0 + MB_SIZE).min(width), (y0 + MB_SIZE).min(height));
    let (mut sum, mut squares, mut n) = (0u64, 0u64, 0u64);
    for y in y0..y1 {
        for &s in &image.row(0, y, x1)[x0..] {
            sum += s as u64;
            squares += s as u64 * s as u64;
            n += 1;
        }
    }
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = sum as f64 / n as f64;
    (mean, squares as f64 / n as f64 - mean * mean)
}

/// Raises the quantizer where artifacts are hard to see and lowers it where they stand out.
struct AdaptiveQuantization {
    method: MaskingMethod,
}

impl AdaptiveQuantization {
    fn offset(&self, mean: f64, variance: f64) -> i32 {
        match self.method {
            MaskingMethod::Luminance if !(40.0..=210.0).contains(&mean) => 2,
            MaskingMethod::Luminance if !(60.0..=190.0).contains(&mean) => 1,
            MaskingMethod::Luminance => 0,
            MaskingMethod::Variance if variance > 900.0 => 2,
            MaskingMethod::Variance if variance > 400.0 => 1,
            MaskingMethod::Variance if variance < 25.0 => -1,
            MaskingMethod::Variance => 0,
        }
    }
}

impl NativePlugin for AdaptiveQuantization {
    fn frame(&mut self, data: &mut PluginCallData<'_>) {
        let (width, height) = (data.width as usize, data.height as usize);
        let stride = data.diff_quantizers_stride;
        let Some(diff_quantizers) = data.diff_quantizers.as_deref_mut() else {
            return;
        };
        for mb_y in 0..data.mb_height as usize {
            for mb_x in 0..data.mb_width as usize {
                let (mean, variance) = luma_statistics(&data.current, width, height, mb_x, mb_y);
                diff_quantizers[mb_y * stride + mb_x] = self.offset(mean, variance);
            }
        }
    }
}

struct PsnrLog;

impl NativePlugin for PsnrLog {
    fn after(&mut self, data: &mut PluginCallData<'_>) {
        let Some(sse) = data.sse else {
            return;
        };
        let luma = data.width as f64 * data.height as f64;
        log::info!(
            "frame {} ({:?}): psnr y {:.2} u {:.2} v {:.2}",
            data.frame_number,
            data.frame_type,
            psnr(sse.y, luma),
            psnr(sse.u, luma / 4.0),
            psnr(sse.v, luma / 4.0)
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        dispatch::test::empty_image,
        image::ColorSpace,
        types::{BFrameQuantizer, EncoderStats, Fraction, MotionFlags, VolFlags, VopFlags},
    };

    fn init() -> PluginInit<'static> {
        PluginInit {
            zones: &[],
            width: 32,
            height: 16,
            mb_width: 2,
            mb_height: 1,
            frame_rate: Fraction::new(25, 1),
        }
    }

    fn call_data<'a>() -> PluginCallData<'a> {
        PluginCallData {
            zone: None,
            width: 32,
            height: 16,
            mb_width: 2,
            mb_height: 1,
            frame_rate: Fraction::new(25, 1),
            quantizer_i: QuantizerRange::default(),
            quantizer_p: QuantizerRange::default(),
            quantizer_b: QuantizerRange::default(),
            reference: empty_image(),
            current: empty_image(),
            original: None,
            frame_number: 0,
            frame_type: None,
            quantizer: 0,
            diff_quantizers: None,
            diff_quantizers_stride: 2,
            lambda: None,
            vol_flags: VolFlags::empty(),
            vop_flags: VopFlags::empty(),
            motion_flags: MotionFlags::empty(),
            b_frame_quantizer: BFrameQuantizer::default(),
            stats: None,
            sse: None,
        }
    }

    fn stats(frame_type: FrameType, quantizer: u32, length: usize) -> EncoderStats {
        EncoderStats {
            frame_type,
            key_frame: frame_type == FrameType::I,
            quantizer,
            vol_flags: VolFlags::empty(),
            vop_flags: VopFlags::empty(),
            length,
            header_length: 12,
            intra_blocks: 0,
            inter_blocks: 0,
            uncoded_blocks: 0,
            sse: None,
        }
    }

    #[test]
    fn test_single_pass_reacts() {
        // 25 fps at 40 kbps is 200 bytes per frame
        let mut rc = SinglePass::new(&SinglePassConfig::new(40_000), &init());
        let mut quantizers = Vec::new();
        for _ in 0..20 {
            let mut data = call_data();
            rc.before(&mut data);
            quantizers.push(data.quantizer);
            data.stats = Some(stats(FrameType::P, data.quantizer, 2000));
            rc.after(&mut data);
        }
        assert_eq!(quantizers[0], 4);
        assert!(quantizers.windows(2).all(|w| w[0] <= w[1]), "{:?}", quantizers);
        assert!(quantizers[19] > 4, "{:?}", quantizers);

        let mut data = call_data();
        data.quantizer = 9;
        rc.before(&mut data);
        assert_eq!(data.quantizer, 9);
    }

    #[test]
    fn test_two_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.txt");

        let mut first = TwoPassFirst::new(&path);
        for (frame_type, length) in [(FrameType::I, 4000), (FrameType::P, 1000), (FrameType::P, 1000)] {
            let mut data = call_data();
            first.before(&mut data);
            assert_eq!(data.quantizer, 2);
            data.stats = Some(stats(frame_type, data.quantizer, length));
            first.after(&mut data);
        }
        first.destroy(3);

        let frames = read_stats(&path).unwrap();
        assert_eq!(
            frames[0],
            FirstPassFrame {
                frame_type: FrameType::I,
                quantizer: 2,
                length: 4000
            }
        );
        assert_eq!(frames.len(), 3);

        // half of the first pass size, before container overhead
        let mut config = TwoPassSecondConfig::new(200_000, &path);
        config.container_frame_overhead = 0;
        config.key_frame_boost = 0;
        let mut second = TwoPassSecond::new(&config, &init()).unwrap();
        let types: Vec<_> = (0..4)
            .map(|_| {
                let mut data = call_data();
                second.before(&mut data);
                (data.frame_type, data.quantizer)
            })
            .collect();
        assert_eq!(types, vec![(Some(FrameType::I), 4), (None, 4), (None, 4), (None, 0)]);
    }

    #[test]
    fn test_two_pass_missing_stats() {
        let dir = tempfile::tempdir().unwrap();
        let config = TwoPassSecondConfig::new(80_000, dir.path().join("missing.txt"));
        assert!(TwoPassSecond::new(&config, &init()).is_err());

        let path = dir.path().join("bad.txt");
        std::fs::write(&path, "i 2 banana\n").unwrap();
        assert_eq!(read_stats(&path).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_first_pass_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = TwoPassFirst::new(&dir.path().join("missing").join("stats.txt"));
        let mut data = call_data();
        data.stats = Some(stats(FrameType::I, 2, 100));
        first.after(&mut data);
        first.destroy(1);
    }

    #[test]
    fn test_adaptive_quantization() {
        let mut luma = vec![128u8; 32 * 16];
        for y in 0..16 {
            for x in 16..32 {
                luma[y * 32 + x] = 10;
            }
        }
        let chroma = vec![128u8; 64];
        let current = ImageRef {
            color_space: ColorSpace::Planar,
            vertical_flip: false,
            planes: vec![&luma[..], &chroma[..], &chroma[..]],
            strides: vec![32, 16, 16],
        };
        let mut diff_quantizers = vec![0i32; 2];
        let mut data = call_data();
        data.current = current;
        data.diff_quantizers = Some(&mut diff_quantizers[..]);

        let mut aq = AdaptiveQuantization {
            method: MaskingMethod::Luminance,
        };
        aq.frame(&mut data);
        assert_eq!(data.diff_quantizers.as_deref(), Some(&[0, 2][..]));

        let mut aq = AdaptiveQuantization {
            method: MaskingMethod::Variance,
        };
        aq.frame(&mut data);
        assert_eq!(data.diff_quantizers.as_deref(), Some(&[-1, -1][..]));
    }
}
