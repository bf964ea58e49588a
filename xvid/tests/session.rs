use rayon::prelude::*;
use std::{
    io::{self, Cursor, Read},
    sync::{Arc, Mutex},
};
use xvid::{
    AfterFrame, BuiltinPlugin, ColorSpace, Decoder, DecoderConfig, DecoderFrame, DecoderStats, DuringFrame, Encoder, EncoderConfig, EncoderFrame,
    Error, Fraction, FrameType, Image, MaskingMethod, Plugin, PluginClose, PluginEntry, PluginFlags, PluginInit, TwoPassSecondConfig,
};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

fn image(luma: u8) -> Image {
    let samples = (WIDTH * HEIGHT) as usize;
    Image {
        color_space: ColorSpace::Planar,
        vertical_flip: false,
        planes: vec![vec![luma; samples], vec![128; samples / 4], vec![128; samples / 4]],
        strides: vec![],
    }
}

#[derive(Clone, Default)]
struct Counts {
    after: Arc<Mutex<u32>>,
    closed: Arc<Mutex<Option<u32>>>,
}

struct Counter(Counts);

impl Plugin for Counter {
    fn after(&mut self, _frame: &AfterFrame<'_>) {
        *self.0.after.lock().unwrap() += 1;
    }

    fn close(&mut self, close: &PluginClose) {
        *self.0.closed.lock().unwrap() = Some(close.num_frames);
    }
}

/// Encodes the images into one contiguous stream.
fn encode(config: EncoderConfig, images: &[Image]) -> Vec<u8> {
    let mut encoder = Encoder::new(config).unwrap();
    let mut stream = Vec::new();
    let mut output = Vec::new();
    for image in images {
        let (length, _) = encoder.encode(EncoderFrame::new(image, &mut output)).unwrap();
        stream.extend_from_slice(&output[..length]);
    }
    encoder.close();
    stream
}

/// Decodes a stream into the stats of every unit and the luma of every picture.
fn decode<R: Read>(input: R, config: DecoderConfig) -> xvid::Result<(Vec<DecoderStats>, Vec<Vec<u8>>)> {
    let mut decoder = Decoder::new(config, input)?;
    let mut output = Image::new(ColorSpace::Planar);
    let (mut stats, mut pictures) = (Vec::new(), Vec::new());
    while let Some(decoded) = decoder.decode(DecoderFrame::new(&mut output))? {
        if let DecoderStats::Frame(_) = decoded.stats {
            pictures.push(output.planes[0].clone());
        }
        stats.push(decoded.stats);
    }
    Ok((stats, pictures))
}

/// Hands out at most a few bytes per read.
struct Trickle<R> {
    inner: R,
    max: usize,
}

impl<R: Read> Read for Trickle<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(self.max);
        self.inner.read(&mut buf[..len])
    }
}

#[test]
fn test_round_trip() {
    let counts = Counts::default();
    let mut config = EncoderConfig::new(WIDTH, HEIGHT, Fraction::new(25, 1));
    config.plugins = vec![PluginEntry::custom(Counter(counts.clone()))];
    let images: Vec<_> = (0..10).map(|_| image(100)).collect();
    let stream = encode(config, &images);
    assert_eq!(*counts.after.lock().unwrap(), 10);
    assert_eq!(*counts.closed.lock().unwrap(), Some(10));

    let (stats, pictures) = decode(Cursor::new(&stream), DecoderConfig::default()).unwrap();
    assert_eq!(stats.len(), 11);
    assert!(matches!(stats[0], DecoderStats::Vol(vol) if vol.width == WIDTH && vol.height == HEIGHT));
    let types: Vec<_> = stats[1..].iter().map(|s| s.frame_type()).collect();
    assert_eq!(types[0], Some(FrameType::I));
    assert!(types[1..].iter().all(|&t| t == Some(FrameType::P)));
    assert_eq!(pictures.len(), 10);
    assert!(pictures.iter().all(|p| p == &images[0].planes[0]));
}

#[test]
fn test_chunked_input() {
    let images: Vec<_> = (0..6).map(|i| image(40 + i * 30)).collect();
    let stream = encode(EncoderConfig::new(WIDTH, HEIGHT, Fraction::new(25, 1)), &images);
    let expected = decode(Cursor::new(&stream), DecoderConfig::default()).unwrap();

    for max in [1, 3, 8, 13, 1000] {
        let config = DecoderConfig {
            buffer_capacity: 64 * 1024,
            ..Default::default()
        };
        let trickle = Trickle {
            inner: Cursor::new(&stream),
            max,
        };
        assert_eq!(decode(trickle, config).unwrap(), expected, "reading {} bytes at a time", max);
    }
}

#[test]
fn test_end_of_stream_is_sticky() {
    let stream = encode(EncoderConfig::new(WIDTH, HEIGHT, Fraction::new(25, 1)), &[image(10), image(20)]);
    let mut decoder = Decoder::new(DecoderConfig::default(), Cursor::new(stream)).unwrap();
    let mut output = Image::new(ColorSpace::NoOutput);
    let mut units = 0;
    while decoder.decode(DecoderFrame::new(&mut output)).unwrap().is_some() {
        units += 1;
    }
    assert_eq!(units, 3);
    for _ in 0..3 {
        assert!(decoder.decode(DecoderFrame::new(&mut output)).unwrap().is_none());
    }
    assert!(decoder.is_finished());
}

#[test]
fn test_internal_layout() {
    let images = [image(60), image(92)];
    let stream = encode(EncoderConfig::new(WIDTH, HEIGHT, Fraction::new(25, 1)), &images);
    let mut decoder = Decoder::new(DecoderConfig::default(), Cursor::new(stream)).unwrap();
    let mut output = Image::new(ColorSpace::Internal);

    let vol = decoder.decode(DecoderFrame::new(&mut output)).unwrap().unwrap();
    assert!(vol.internal.is_none());
    for image in &images {
        let decoded = decoder.decode(DecoderFrame::new(&mut output)).unwrap().unwrap();
        let internal = decoded.internal.expect("internal image");
        assert_eq!(internal.color_space, ColorSpace::Internal);
        assert_eq!(internal.strides[0], WIDTH as usize);
        assert_eq!(internal.planes[0], &image.planes[0][..]);
    }
    assert!(output.planes.is_empty());
}

#[test]
fn test_i420_output_with_brightness() {
    let stream = encode(EncoderConfig::new(WIDTH, HEIGHT, Fraction::new(25, 1)), &[image(100)]);
    let mut decoder = Decoder::new(DecoderConfig::default(), Cursor::new(stream)).unwrap();
    let mut output = Image::new(ColorSpace::I420);
    decoder.decode(DecoderFrame::new(&mut output)).unwrap().unwrap();

    let mut frame = DecoderFrame::new(&mut output);
    frame.brightness = 20;
    decoder.decode(frame).unwrap().unwrap();
    let luma = (WIDTH * HEIGHT) as usize;
    assert_eq!(output.planes.len(), 1);
    assert_eq!(output.strides, vec![WIDTH as usize]);
    assert_eq!(output.planes[0].len(), luma * 3 / 2);
    assert!(output.planes[0][..luma].iter().all(|&s| s == 120));
    assert!(output.planes[0][luma..].iter().all(|&s| s == 128));
}

#[test]
fn test_poisoned_session_replays_error() {
    let mut stream = encode(EncoderConfig::new(WIDTH, HEIGHT, Fraction::new(25, 1)), &[image(10)]);
    // the version byte is the first byte of the sequence header's payload
    stream[8] = 0x7f;
    let mut decoder = Decoder::new(DecoderConfig::default(), Cursor::new(stream)).unwrap();
    let mut output = Image::new(ColorSpace::Planar);
    for _ in 0..2 {
        assert!(matches!(decoder.decode(DecoderFrame::new(&mut output)), Err(Error::VersionMismatch)));
    }
    assert!(matches!(decoder.state().error(), Some(Error::VersionMismatch)));
    decoder.close();
    assert!(matches!(decoder.decode(DecoderFrame::new(&mut output)), Err(Error::Closed)));
}

#[test]
fn test_two_pass() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pass1.log");
    let images: Vec<_> = (0..5).map(|i| image(50 + i * 10)).collect();

    let mut config = EncoderConfig::new(WIDTH, HEIGHT, Fraction::new(25, 1));
    config.plugins = vec![BuiltinPlugin::TwoPassFirst { path: path.clone() }.into()];
    encode(config, &images);
    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<_> = contents.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(lines.len(), 5);
    assert!(lines[0].starts_with("i 2 "), "first line is {:?}", lines[0]);

    let mut config = EncoderConfig::new(WIDTH, HEIGHT, Fraction::new(25, 1));
    config.plugins = vec![BuiltinPlugin::TwoPassSecond(TwoPassSecondConfig::new(100_000, &path)).into()];
    let stream = encode(config, &images);
    let (stats, _) = decode(Cursor::new(stream), DecoderConfig::default()).unwrap();
    assert_eq!(stats.len(), 6);

    let mut config = EncoderConfig::new(WIDTH, HEIGHT, Fraction::new(25, 1));
    let missing = dir.path().join("missing.log");
    config.plugins = vec![BuiltinPlugin::TwoPassSecond(TwoPassSecondConfig::new(100_000, missing)).into()];
    assert!(matches!(Encoder::new(config), Err(Error::GeneralFault)));
}

#[derive(Default)]
struct Seen {
    original: Vec<bool>,
    diff_quantizers: Vec<Option<Vec<i32>>>,
    psnr: Vec<bool>,
}

struct Observer {
    flags: PluginFlags,
    seen: Arc<Mutex<Seen>>,
}

impl Plugin for Observer {
    fn info(&self) -> PluginFlags {
        self.flags
    }

    fn init(&mut self, init: &PluginInit<'_>) -> bool {
        assert_eq!((init.mb_width, init.mb_height), (4, 3));
        true
    }

    fn frame(&mut self, frame: &mut DuringFrame<'_>) {
        let table = frame.diff_quantizers().map(|t| t.to_vec());
        self.seen.lock().unwrap().diff_quantizers.push(table);
    }

    fn after(&mut self, frame: &AfterFrame<'_>) {
        let mut seen = self.seen.lock().unwrap();
        seen.original.push(frame.original.is_some());
        seen.psnr.push(frame.psnr().is_some());
    }
}

#[test]
fn test_builtins_interleaved_with_custom_plugins() {
    let first = Arc::new(Mutex::new(Seen::default()));
    let second = Arc::new(Mutex::new(Seen::default()));
    let mut config = EncoderConfig::new(WIDTH, HEIGHT, Fraction::new(25, 1));
    config.plugins = vec![
        BuiltinPlugin::Psnr.into(),
        PluginEntry::custom(Observer {
            flags: PluginFlags::ORIGINAL,
            seen: first.clone(),
        }),
        BuiltinPlugin::AdaptiveQuantization(MaskingMethod::Luminance).into(),
        PluginEntry::custom(Observer {
            flags: PluginFlags::DIFF_QUANTIZERS | PluginFlags::PSNR,
            seen: second.clone(),
        }),
    ];
    encode(config, &[image(10), image(10)]);

    let first = first.lock().unwrap();
    assert_eq!(first.original, vec![true, true]);
    assert_eq!(first.diff_quantizers, vec![None, None]);
    assert_eq!(first.psnr, vec![false, false]);

    // the adaptive quantizer ran first and raised every dark macroblock
    let second = second.lock().unwrap();
    assert_eq!(second.original, vec![false, false]);
    assert_eq!(second.diff_quantizers, vec![Some(vec![2; 12]), Some(vec![2; 12])]);
    assert_eq!(second.psnr, vec![true, true]);
}

#[test]
fn test_concurrent_sessions() {
    let results: Vec<_> = (0..8u8)
        .into_par_iter()
        .map(|i| {
            let counts = Counts::default();
            let mut config = EncoderConfig::new(WIDTH, HEIGHT, Fraction::new(25, 1));
            config.plugins = vec![PluginEntry::custom(Counter(counts.clone()))];
            let images: Vec<_> = (0..=i).map(|_| image(i * 20)).collect();
            let stream = encode(config, &images);
            let (_, pictures) = decode(Cursor::new(stream), DecoderConfig::default()).unwrap();
            let after = *counts.after.lock().unwrap();
            (i, after, pictures)
        })
        .collect();
    for (i, after, pictures) in results {
        assert_eq!(after, i as u32 + 1);
        assert_eq!(pictures.len(), i as usize + 1);
        assert!(pictures.iter().all(|p| p.iter().all(|&s| s == i * 20)));
    }
}

#[test]
fn test_veto() {
    struct Refuse;
    impl Plugin for Refuse {
        fn init(&mut self, _init: &PluginInit<'_>) -> bool {
            false
        }
    }

    let counts = Counts::default();
    let mut config = EncoderConfig::new(WIDTH, HEIGHT, Fraction::new(25, 1));
    config.plugins = vec![
        PluginEntry::custom(Counter(counts.clone())),
        BuiltinPlugin::Psnr.into(),
        PluginEntry::custom(Refuse),
    ];
    assert!(matches!(Encoder::new(config), Err(Error::PluginVeto { index: 2 })));
    assert_eq!(*counts.closed.lock().unwrap(), None);
}
