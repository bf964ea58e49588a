use crate::{
    codec::{PluginCallData, PluginHost, PluginSlot, PluginToken},
    plugin::{AfterFrame, BeforeFrame, DuringFrame, FrameData, Plugin, PluginClose, PluginEntry, PluginFlags, PluginInit},
};

struct Slot {
    /// `None` for plugins the codec implements itself.
    plugin: Option<Box<dyn Plugin>>,
    flags: PluginFlags,
}

/// Routes codec callbacks to the session's plugins.
///
/// Custom plugins are identified by their position in the chain. Info callbacks don't carry that
/// position, so they're matched up by walking the chain in order, skipping built-in entries. Codecs
/// must therefore issue exactly one info callback per custom plugin, in registration order.
pub struct Dispatcher {
    slots: Vec<Slot>,
    info_cursor: usize,
    vetoed: Option<usize>,
}

impl Dispatcher {
    /// Takes ownership of a plugin chain, returning the dispatcher along with the slots to hand to
    /// the codec.
    pub fn new(entries: Vec<PluginEntry>) -> (Self, Vec<PluginSlot>) {
        let mut slots = Vec::with_capacity(entries.len());
        let mut codec_slots = Vec::with_capacity(entries.len());
        for (i, entry) in entries.into_iter().enumerate() {
            match entry {
                PluginEntry::Builtin(builtin) => {
                    slots.push(Slot {
                        plugin: None,
                        flags: builtin.info(),
                    });
                    codec_slots.push(PluginSlot::Builtin(builtin));
                }
                PluginEntry::Custom(plugin) => {
                    slots.push(Slot {
                        plugin: Some(plugin),
                        flags: PluginFlags::empty(),
                    });
                    codec_slots.push(PluginSlot::Custom(PluginToken(i)));
                }
            }
        }
        (
            Self {
                slots,
                info_cursor: 0,
                vetoed: None,
            },
            codec_slots,
        )
    }

    /// The index of the plugin that refused to initialize, if any.
    pub fn vetoed(&self) -> Option<usize> {
        self.vetoed
    }

    fn slot_mut(&mut self, token: PluginToken) -> Option<(&mut dyn Plugin, PluginFlags)> {
        match self.slots.get_mut(token.0) {
            Some(Slot { plugin: Some(plugin), flags }) => Some((plugin.as_mut(), *flags)),
            _ => {
                log::error!("callback for unknown plugin {}", token.0);
                None
            }
        }
    }
}

fn frame_data<'a>(data: &PluginCallData<'a>) -> FrameData<'a> {
    FrameData {
        zone: data.zone,
        width: data.width,
        height: data.height,
        mb_width: data.mb_width,
        mb_height: data.mb_height,
        frame_rate: data.frame_rate,
        quantizer_i: data.quantizer_i,
        quantizer_p: data.quantizer_p,
        quantizer_b: data.quantizer_b,
        frame_number: data.frame_number,
        reference: data.reference.clone(),
        current: data.current.clone(),
        b_frame_quantizer: data.b_frame_quantizer,
        diff_quantizers_stride: data.diff_quantizers_stride,
    }
}

impl PluginHost for Dispatcher {
    fn info(&mut self) -> PluginFlags {
        while let Some(slot) = self.slots.get_mut(self.info_cursor) {
            self.info_cursor += 1;
            if let Some(plugin) = &slot.plugin {
                slot.flags = plugin.info();
                return slot.flags;
            }
        }
        log::error!("info callback with no custom plugin left to answer it");
        PluginFlags::empty()
    }

    fn create(&mut self, token: PluginToken, init: &PluginInit<'_>) -> bool {
        let Some((plugin, _)) = self.slot_mut(token) else {
            return false;
        };
        if plugin.init(init) {
            return true;
        }
        log::debug!("plugin {} refused to initialize", token.0);
        self.vetoed = Some(token.0);
        false
    }

    fn before(&mut self, token: PluginToken, data: &mut PluginCallData<'_>) {
        let Some((plugin, _)) = self.slot_mut(token) else {
            return;
        };
        let mut view = BeforeFrame {
            data: frame_data(data),
            frame_type: data.frame_type,
            quantizer: data.quantizer,
            vol_flags: data.vol_flags,
            vop_flags: data.vop_flags,
            motion_flags: data.motion_flags,
        };
        plugin.before(&mut view);
        data.frame_type = view.frame_type;
        data.quantizer = view.quantizer;
        data.vol_flags = view.vol_flags;
        data.vop_flags = view.vop_flags;
        data.motion_flags = view.motion_flags;
    }

    fn frame(&mut self, token: PluginToken, data: &mut PluginCallData<'_>) {
        let Some((plugin, flags)) = self.slot_mut(token) else {
            return;
        };
        let mut view = DuringFrame {
            data: frame_data(data),
            frame_type: data.frame_type,
            quantizer: data.quantizer,
            vol_flags: data.vol_flags,
            vop_flags: data.vop_flags,
            motion_flags: data.motion_flags,
            diff_quantizers: match flags.contains(PluginFlags::DIFF_QUANTIZERS) {
                true => data.diff_quantizers.as_deref_mut(),
                false => None,
            },
            lambda: match flags.contains(PluginFlags::LAMBDA) {
                true => data.lambda.as_deref_mut(),
                false => None,
            },
        };
        plugin.frame(&mut view);
        let (frame_type, quantizer) = (view.frame_type, view.quantizer);
        data.frame_type = frame_type;
        data.quantizer = quantizer;
    }

    fn after(&mut self, token: PluginToken, data: &mut PluginCallData<'_>) {
        let Some((plugin, flags)) = self.slot_mut(token) else {
            return;
        };
        let view = AfterFrame {
            data: frame_data(data),
            frame_type: data.frame_type,
            quantizer: data.quantizer,
            vol_flags: data.vol_flags,
            vop_flags: data.vop_flags,
            motion_flags: data.motion_flags,
            original: match flags.contains(PluginFlags::ORIGINAL) {
                true => data.original.clone(),
                false => None,
            },
            diff_quantizers: data.diff_quantizers.as_deref(),
            stats: data.stats,
            sse: match flags.contains(PluginFlags::PSNR) {
                true => data.sse,
                false => None,
            },
        };
        plugin.after(&view);
    }

    fn destroy(&mut self, token: PluginToken, close: Option<&PluginClose>) {
        // Without data, the encoder is being torn down part way through its creation.
        let Some(close) = close else {
            return;
        };
        if let Some((plugin, _)) = self.slot_mut(token) {
            plugin.close(close);
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        image::{ColorSpace, ImageRef},
        plugin::{BuiltinPlugin, MaskingMethod},
        types::{BFrameQuantizer, Fraction, FrameType, MotionFlags, PlaneErrors, QuantizerRange, VolFlags, VopFlags},
    };
    use std::sync::{Arc, Mutex};

    pub fn empty_image<'a>() -> ImageRef<'a> {
        ImageRef {
            color_space: ColorSpace::Planar,
            vertical_flip: false,
            planes: vec![&[][..], &[][..], &[][..]],
            strides: vec![0, 0, 0],
        }
    }

    fn call_data<'a>(diff_quantizers: &'a mut [i32], lambda: &'a mut [f32]) -> PluginCallData<'a> {
        PluginCallData {
            zone: None,
            width: 32,
            height: 16,
            mb_width: 2,
            mb_height: 1,
            frame_rate: Fraction::new(30, 1),
            quantizer_i: QuantizerRange::default(),
            quantizer_p: QuantizerRange::default(),
            quantizer_b: QuantizerRange::default(),
            reference: empty_image(),
            current: empty_image(),
            original: Some(empty_image()),
            frame_number: 7,
            frame_type: Some(FrameType::P),
            quantizer: 4,
            diff_quantizers: Some(diff_quantizers),
            diff_quantizers_stride: 2,
            lambda: Some(lambda),
            vol_flags: VolFlags::empty(),
            vop_flags: VopFlags::HALF_PEL,
            motion_flags: MotionFlags::empty(),
            b_frame_quantizer: BFrameQuantizer::default(),
            stats: None,
            sse: Some(PlaneErrors { y: 10, u: 1, v: 1 }),
        }
    }

    #[derive(Default)]
    struct Recorder {
        flags: PluginFlags,
        events: Arc<Mutex<Vec<String>>>,
        veto: bool,
    }

    impl Plugin for Recorder {
        fn info(&self) -> PluginFlags {
            self.flags
        }

        fn init(&mut self, init: &PluginInit<'_>) -> bool {
            self.events.lock().unwrap().push(format!("init {}x{}", init.width, init.height));
            !self.veto
        }

        fn before(&mut self, frame: &mut BeforeFrame<'_>) {
            frame.frame_type = Some(FrameType::I);
            frame.quantizer = 9;
            frame.vop_flags |= VopFlags::GREYSCALE;
        }

        fn frame(&mut self, frame: &mut DuringFrame<'_>) {
            frame.quantizer += 1;
            let had_tables = (frame.diff_quantizers().is_some(), frame.lambda().is_some());
            if let Some(dq) = frame.diff_quantizers() {
                dq[1] = -2;
            }
            self.events.lock().unwrap().push(format!("frame {:?}", had_tables));
        }

        fn after(&mut self, frame: &AfterFrame<'_>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("after {} {} {}", frame.frame_number, frame.original.is_some(), frame.psnr().is_some()));
        }

        fn close(&mut self, close: &PluginClose) {
            self.events.lock().unwrap().push(format!("close {}", close.num_frames));
        }
    }

    #[test]
    fn test_info_skips_builtins() {
        let (mut dispatcher, slots) = Dispatcher::new(vec![
            BuiltinPlugin::Psnr.into(),
            PluginEntry::custom(Recorder {
                flags: PluginFlags::ORIGINAL,
                ..Default::default()
            }),
            BuiltinPlugin::AdaptiveQuantization(MaskingMethod::Luminance).into(),
            PluginEntry::custom(Recorder {
                flags: PluginFlags::LAMBDA,
                ..Default::default()
            }),
        ]);
        assert!(matches!(slots[0], PluginSlot::Builtin(BuiltinPlugin::Psnr)));
        assert!(matches!(slots[1], PluginSlot::Custom(PluginToken(1))));
        assert!(matches!(slots[3], PluginSlot::Custom(PluginToken(3))));

        assert_eq!(dispatcher.info(), PluginFlags::ORIGINAL);
        assert_eq!(dispatcher.info(), PluginFlags::LAMBDA);
        assert_eq!(dispatcher.info(), PluginFlags::empty());
    }

    #[test]
    fn test_veto() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (mut dispatcher, _) = Dispatcher::new(vec![
            BuiltinPlugin::Psnr.into(),
            PluginEntry::custom(Recorder {
                events: events.clone(),
                veto: true,
                ..Default::default()
            }),
        ]);
        let init = PluginInit {
            zones: &[],
            width: 32,
            height: 16,
            mb_width: 2,
            mb_height: 1,
            frame_rate: Fraction::new(30, 1),
        };
        assert!(!dispatcher.create(PluginToken(1), &init));
        assert_eq!(dispatcher.vetoed(), Some(1));

        dispatcher.destroy(PluginToken(1), None);
        assert_eq!(*events.lock().unwrap(), vec!["init 32x16".to_string()]);
    }

    #[test]
    fn test_write_scope() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (mut dispatcher, _) = Dispatcher::new(vec![PluginEntry::custom(Recorder {
            flags: PluginFlags::DIFF_QUANTIZERS,
            events: events.clone(),
            ..Default::default()
        })]);
        dispatcher.info();

        let mut dq = [0i32; 2];
        let mut lambda = [1.0f32; 12];
        let mut data = call_data(&mut dq, &mut lambda);

        dispatcher.before(PluginToken(0), &mut data);
        assert_eq!(data.frame_type, Some(FrameType::I));
        assert_eq!(data.quantizer, 9);
        assert_eq!(data.vop_flags, VopFlags::HALF_PEL | VopFlags::GREYSCALE);

        dispatcher.frame(PluginToken(0), &mut data);
        assert_eq!(data.quantizer, 10);
        assert_eq!(data.diff_quantizers.as_deref(), Some(&[0, -2][..]));

        dispatcher.after(PluginToken(0), &mut data);
        assert_eq!(data.frame_type, Some(FrameType::I));
        assert_eq!(data.quantizer, 10);
        assert_eq!(data.frame_number, 7);

        dispatcher.destroy(PluginToken(0), Some(&PluginClose { num_frames: 1 }));
        assert_eq!(
            *events.lock().unwrap(),
            vec!["frame (true, false)".to_string(), "after 7 false false".to_string(), "close 1".to_string()]
        );
    }

    #[test]
    fn test_requested_data() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (mut dispatcher, _) = Dispatcher::new(vec![PluginEntry::custom(Recorder {
            flags: PluginFlags::ORIGINAL | PluginFlags::PSNR | PluginFlags::LAMBDA,
            events: events.clone(),
            ..Default::default()
        })]);
        dispatcher.info();

        let mut dq = [0i32; 2];
        let mut lambda = [1.0f32; 12];
        let mut data = call_data(&mut dq, &mut lambda);
        dispatcher.frame(PluginToken(0), &mut data);
        dispatcher.after(PluginToken(0), &mut data);
        assert_eq!(data.diff_quantizers.as_deref(), Some(&[0, 0][..]));
        assert_eq!(
            *events.lock().unwrap(),
            vec!["frame (false, true)".to_string(), "after 7 true true".to_string()]
        );
    }
}
