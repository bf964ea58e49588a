use super::{
    bitstream::UnitWriter,
    header::{VolHeader, VopHeader},
    mb_dimensions,
    picture::{Picture, PictureCoding},
    ratecontrol::{self, NativePlugin},
};
use crate::{
    codec::{CodecError, EncodeRequest, EncoderBackend, EncoderCreate, PluginCallData, PluginHost, PluginSlot, PluginToken},
    image::ColorSpace,
    plugin::{PluginClose, PluginFlags, PluginInit},
    types::{
        BFrameQuantizer, EncoderFlags, EncoderStats, Fraction, FrameType, MotionFlags, QuantizerRange, VolFlags, VopFlags, Zone, ZoneMode,
    },
};
use scopeguard::ScopeGuard;

const LAMBDA_PER_MACROBLOCK: usize = 6;

enum ActivePlugin {
    Builtin(Box<dyn NativePlugin>),
    Custom(PluginToken),
}

#[derive(Clone, Copy)]
enum Phase {
    Before,
    Frame,
    After,
}

fn run(plugins: &mut [ActivePlugin], host: &mut dyn PluginHost, data: &mut PluginCallData<'_>, phase: Phase) {
    for plugin in plugins {
        match (plugin, phase) {
            (ActivePlugin::Builtin(p), Phase::Before) => p.before(data),
            (ActivePlugin::Builtin(p), Phase::Frame) => p.frame(data),
            (ActivePlugin::Builtin(p), Phase::After) => p.after(data),
            (ActivePlugin::Custom(token), Phase::Before) => host.before(*token, data),
            (ActivePlugin::Custom(token), Phase::Frame) => host.frame(*token, data),
            (ActivePlugin::Custom(token), Phase::After) => host.after(*token, data),
        }
    }
}

/// Parameters fixed when the encoder is created.
struct Settings {
    width: u32,
    height: u32,
    mb_width: usize,
    mb_height: usize,
    zones: Vec<Zone>,
    flags: EncoderFlags,
    frame_rate: Fraction,
    max_key_interval: u32,
    frame_drop_ratio: u32,
    b_frame_quantizer: BFrameQuantizer,
    quantizer_i: QuantizerRange,
    quantizer_p: QuantizerRange,
    quantizer_b: QuantizerRange,
    start_frame_number: u32,
}

impl Settings {
    fn range(&self, frame_type: FrameType) -> QuantizerRange {
        match frame_type {
            FrameType::I => self.quantizer_i,
            FrameType::B => self.quantizer_b,
            FrameType::P | FrameType::S => self.quantizer_p,
        }
    }

    fn call_data<'a>(&self, frame_number: u32, reference: &'a Picture, current: &'a Picture) -> PluginCallData<'a> {
        PluginCallData {
            zone: Zone::find(&self.zones, frame_number),
            width: self.width,
            height: self.height,
            mb_width: self.mb_width as u32,
            mb_height: self.mb_height as u32,
            frame_rate: self.frame_rate,
            quantizer_i: self.quantizer_i,
            quantizer_p: self.quantizer_p,
            quantizer_b: self.quantizer_b,
            reference: reference.as_image(ColorSpace::Planar),
            current: current.as_image(ColorSpace::Planar),
            original: None,
            frame_number,
            frame_type: None,
            quantizer: 0,
            diff_quantizers: None,
            diff_quantizers_stride: self.mb_width,
            lambda: None,
            vol_flags: VolFlags::empty(),
            vop_flags: VopFlags::empty(),
            motion_flags: MotionFlags::empty(),
            b_frame_quantizer: self.b_frame_quantizer,
            stats: None,
            sse: None,
        }
    }
}

/// Codes every picture as I or P against the previous reconstruction. B and S frame requests are
/// coded as P frames since pictures are never reordered.
///
/// Plugins that ask for the lambda table may write to it, but the writes have no effect.
pub struct ReferenceEncoder {
    settings: Settings,
    plugins: Vec<ActivePlugin>,
    needs: PluginFlags,
    source: Picture,
    reference: Picture,
    recon: Picture,
    has_reference: bool,
    diff_quantizers: Vec<i32>,
    lambda: Vec<f32>,
    mb_quantizers: Vec<u8>,
    frames: u32,
    since_key: u32,
    vol: Option<VolHeader>,
}

impl ReferenceEncoder {
    pub(super) fn open(create: &EncoderCreate<'_>, host: &mut dyn PluginHost) -> Result<Self, CodecError> {
        let (width, height) = (create.width, create.height);
        if width % 2 != 0 || height % 2 != 0 || width > u16::MAX as u32 || height > u16::MAX as u32 {
            log::warn!("the reference encoder doesn't support {}x{} pictures", width, height);
            return Err(CodecError::FAIL);
        }
        let (mb_width, mb_height) = mb_dimensions(width, height);
        log::debug!(
            "opening reference encoder ({}x{}, {} threads, {} slices, up to {} b-frames requested)",
            width,
            height,
            create.num_threads,
            create.num_slices,
            create.max_b_frames
        );

        let mut needs = PluginFlags::empty();
        for slot in &create.plugins {
            needs |= match slot {
                PluginSlot::Builtin(plugin) => plugin.info(),
                PluginSlot::Custom(_) => host.info(),
            };
        }

        let init = PluginInit {
            zones: create.zones,
            width,
            height,
            mb_width: mb_width as u32,
            mb_height: mb_height as u32,
            frame_rate: create.frame_rate,
        };
        // plugins that were already created are torn down if a later one fails
        let mut created = scopeguard::guard((Vec::<ActivePlugin>::new(), host), |(plugins, host)| {
            for plugin in plugins {
                if let ActivePlugin::Custom(token) = plugin {
                    host.destroy(token, None);
                }
            }
        });
        for slot in &create.plugins {
            let plugin = match slot {
                PluginSlot::Builtin(plugin) => ActivePlugin::Builtin(ratecontrol::create(plugin, &init)?),
                PluginSlot::Custom(token) => {
                    if !created.1.create(*token, &init) {
                        log::warn!("plugin {} refused to start", token.index());
                        return Err(CodecError::FAIL);
                    }
                    ActivePlugin::Custom(*token)
                }
            };
            created.0.push(plugin);
        }
        let (plugins, _) = ScopeGuard::into_inner(created);

        let mb_count = mb_width * mb_height;
        Ok(Self {
            settings: Settings {
                width,
                height,
                mb_width,
                mb_height,
                zones: create.zones.to_vec(),
                flags: create.flags,
                frame_rate: create.frame_rate,
                max_key_interval: create.max_key_interval,
                frame_drop_ratio: create.frame_drop_ratio,
                b_frame_quantizer: create.b_frame_quantizer,
                quantizer_i: create.quantizer_i,
                quantizer_p: create.quantizer_p,
                quantizer_b: create.quantizer_b,
                start_frame_number: create.start_frame_number,
            },
            plugins,
            needs,
            source: Picture::new(width, height, 0),
            reference: Picture::new(width, height, 128),
            recon: Picture::new(width, height, 0),
            has_reference: false,
            diff_quantizers: vec![0; mb_count],
            lambda: vec![1.0; mb_count * LAMBDA_PER_MACROBLOCK],
            mb_quantizers: vec![0; mb_count],
            frames: 0,
            since_key: 0,
            vol: None,
        })
    }

    fn forced_key_frame(&self) -> bool {
        !self.has_reference || (self.settings.max_key_interval > 0 && self.since_key + 1 >= self.settings.max_key_interval)
    }

    fn frame_type(&self, requested: Option<FrameType>, forced_key: bool) -> FrameType {
        match requested {
            _ if forced_key => FrameType::I,
            _ if !self.has_reference => FrameType::I,
            Some(FrameType::I) => FrameType::I,
            Some(other @ (FrameType::B | FrameType::S)) => {
                log::trace!("coding {:?} frame as P", other);
                FrameType::P
            }
            Some(FrameType::P) | None => FrameType::P,
        }
    }

    fn quantizer(&self, frame_type: FrameType, zone: Option<Zone>, requested: u32) -> u32 {
        let quantizer = match zone {
            Some(zone) if zone.mode == ZoneMode::Quantizer && zone.value.as_f32() > 0.0 => zone.value.as_f32().round() as u32,
            _ => requested,
        };
        let range = self.settings.range(frame_type);
        match quantizer {
            0 => range.effective_min(),
            q => range.clamp(q),
        }
    }

    fn should_drop(&self, frame_type: FrameType, uncoded: u32) -> bool {
        let ratio = self.settings.frame_drop_ratio as usize;
        let mb_count = self.settings.mb_width * self.settings.mb_height;
        frame_type == FrameType::P && ratio > 0 && uncoded as usize * 100 >= mb_count * (100 - ratio)
    }
}

impl EncoderBackend for ReferenceEncoder {
    fn encode(&mut self, request: &EncodeRequest<'_>, output: &mut [u8], host: &mut dyn PluginHost) -> Result<(usize, Option<EncoderStats>), CodecError> {
        self.source.import(&request.input)?;
        let frame_number = self.settings.start_frame_number + self.frames;
        self.frames += 1;
        let zone = Zone::find(&self.settings.zones, frame_number);
        let forced_key = self.forced_key_frame();

        let (requested_type, requested_quantizer, vol_flags, vop_flags, motion_flags) = {
            let mut data = self.settings.call_data(frame_number, &self.reference, &self.source);
            data.frame_type = request.frame_type;
            data.quantizer = request.quantizer;
            data.vol_flags = request.vol_flags;
            data.vop_flags = request.vop_flags;
            data.motion_flags = request.motion_flags;
            run(&mut self.plugins, host, &mut data, Phase::Before);
            (data.frame_type, data.quantizer, data.vol_flags, data.vop_flags, data.motion_flags)
        };
        let frame_type = self.frame_type(requested_type, forced_key);
        let quantizer = self.quantizer(frame_type, zone, requested_quantizer);

        self.diff_quantizers.fill(0);
        self.lambda.fill(1.0);
        let (frame_type, quantizer) = {
            let mut data = self.settings.call_data(frame_number, &self.reference, &self.source);
            data.frame_type = Some(frame_type);
            data.quantizer = quantizer;
            data.vol_flags = vol_flags;
            data.vop_flags = vop_flags;
            data.motion_flags = motion_flags;
            if self.needs.contains(PluginFlags::DIFF_QUANTIZERS) {
                data.diff_quantizers = Some(&mut self.diff_quantizers[..]);
            }
            if self.needs.contains(PluginFlags::LAMBDA) {
                data.lambda = Some(&mut self.lambda[..]);
            }
            run(&mut self.plugins, host, &mut data, Phase::Frame);
            (data.frame_type, data.quantizer)
        };
        let frame_type = match frame_type {
            _ if forced_key => FrameType::I,
            Some(FrameType::I) => FrameType::I,
            _ => FrameType::P,
        };
        let quantizer = self.quantizer(frame_type, zone, quantizer);
        for (q, &dq) in self.mb_quantizers.iter_mut().zip(&self.diff_quantizers) {
            *q = (quantizer as i32).saturating_add(dq).clamp(1, 31) as u8;
        }

        let mut w = UnitWriter::new(output);
        let vol = VolHeader {
            width: self.settings.width,
            height: self.settings.height,
            flags: vol_flags,
            pixel_aspect_ratio: request.pixel_aspect_ratio,
            frame_rate: match request.frame_rate_denominator {
                0 => self.settings.frame_rate,
                denominator => Fraction::new(self.settings.frame_rate.numerator, denominator),
            },
        };
        if self.vol.is_none() || (frame_type == FrameType::I && self.vol != Some(vol)) {
            vol.write(&mut w)?;
            self.vol = Some(vol);
        }
        let header = VopHeader {
            frame_type,
            quantizer: quantizer as u8,
            top_field_first: vop_flags.contains(VopFlags::TOP_FIELD_FIRST),
            greyscale: vop_flags.contains(VopFlags::GREYSCALE),
        };
        let start = header.write(&mut w, &self.mb_quantizers)?;
        let header_length = w.position();
        let coding = PictureCoding {
            mb_width: self.settings.mb_width,
            mb_height: self.settings.mb_height,
            quantizers: &self.mb_quantizers,
            reference: (frame_type != FrameType::I).then_some(&self.reference),
            greyscale: header.greyscale,
        };
        let counts = coding.encode(&mut w, &self.source, &mut self.recon)?;
        w.end_unit(start)?;
        let length = w.position();

        if self.should_drop(frame_type, counts.uncoded) {
            log::trace!("dropping frame {}", frame_number);
            self.since_key += 1;
            return Ok((0, None));
        }

        let extra_stats = vol_flags.contains(VolFlags::EXTRA_STATS);
        let sse = (extra_stats || self.needs.contains(PluginFlags::PSNR)).then(|| self.recon.sse(&self.source));
        let stats = EncoderStats {
            frame_type,
            key_frame: frame_type == FrameType::I,
            quantizer,
            vol_flags,
            vop_flags,
            length,
            header_length,
            intra_blocks: counts.intra,
            inter_blocks: counts.inter,
            uncoded_blocks: counts.uncoded,
            sse: sse.filter(|_| extra_stats),
        };

        {
            let mut data = self.settings.call_data(frame_number, &self.reference, &self.recon);
            data.frame_type = Some(frame_type);
            data.quantizer = quantizer;
            data.vol_flags = vol_flags;
            data.vop_flags = vop_flags;
            data.motion_flags = motion_flags;
            if self.needs.contains(PluginFlags::ORIGINAL) || self.settings.flags.contains(EncoderFlags::EXTRA_STATS_ENABLE) {
                data.original = Some(self.source.as_image(ColorSpace::Planar));
            }
            if self.needs.contains(PluginFlags::DIFF_QUANTIZERS) {
                data.diff_quantizers = Some(&mut self.diff_quantizers[..]);
            }
            data.stats = Some(stats);
            data.sse = sse;
            run(&mut self.plugins, host, &mut data, Phase::After);
        }

        std::mem::swap(&mut self.reference, &mut self.recon);
        self.has_reference = true;
        self.since_key = match frame_type {
            FrameType::I => 0,
            _ => self.since_key + 1,
        };
        Ok((length, Some(stats)))
    }

    fn close(mut self, host: &mut dyn PluginHost) {
        let close = PluginClose { num_frames: self.frames };
        for plugin in &mut self.plugins {
            match plugin {
                ActivePlugin::Builtin(p) => p.destroy(close.num_frames),
                ActivePlugin::Custom(token) => host.destroy(*token, Some(&close)),
            }
        }
        log::debug!("closed reference encoder after {} frames", self.frames);
    }
}
