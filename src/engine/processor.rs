//! The audio engine: lifecycle, thread-safe parameter exchange, and the
//! per-block DSP pipeline.
//!
//! One dedicated worker thread runs the mic -> DSP -> headphone loop. The
//! codec's blocking read paces the loop; everything else is non-blocking
//! compute. Callers talk to the engine through clamped setters and the
//! `levels()` snapshot, serialized by a single short-critical-section mutex
//! that is never held across codec I/O or DSP work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use log::{error, info, warn};
use thiserror::Error;
use thread_priority::{set_current_thread_priority, ThreadPriority};

use crate::dsp::biquad::{Biquad, Coeffs};
use crate::dsp::meter::ChannelMeter;
use crate::dsp::nlms::NlmsFilter;
use crate::dsp::resampler::{Downsampler3, Upsampler3};
use crate::dsp::tinnitus::{NotchStage, TinnitusLayer};
use crate::engine::bridge::{f32_to_i16, i16_to_f32, AecFrameBridge};
use crate::engine::codec::Codec;
use crate::engine::helpers::{
    AecProcessor, AgcProcessor, HelperError, HelperSuite, NsProcessor, VadDetector, AEC_FRAME,
    NS_FRAME,
};
use crate::engine::params::{EngineParams, Levels, VeMode, EQ_FREQUENCIES, EQ_Q};
use crate::engine::{BLOCK_SIZE, NUM_CHANNELS_IN, NUM_CHANNELS_OUT, SAMPLE_RATE};

/// Blocks between headphone-detect probes (~0.5 s).
const HP_DETECT_INTERVAL: u32 = 48;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine already running")]
    AlreadyRunning,

    #[error("failed to spawn DSP worker: {0}")]
    Spawn(String),
}

/// State behind the parameter mutex.
struct SharedState {
    params: EngineParams,
    levels: Levels,
    dirty: bool,
}

fn lock_shared(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Real-time audio enhancement engine.
///
/// Constructed once at startup with its codec and helper collaborators and
/// passed to whoever needs it; there is no hidden global instance.
pub struct AudioEngine {
    shared: Arc<Mutex<SharedState>>,
    running: Arc<AtomicBool>,
    codec: Arc<Mutex<Option<Box<dyn Codec>>>>,
    helpers: Arc<dyn HelperSuite>,
    worker: Option<JoinHandle<()>>,
}

impl AudioEngine {
    pub fn new(codec: Box<dyn Codec>, helpers: Arc<dyn HelperSuite>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(SharedState {
                params: EngineParams::default(),
                levels: Levels::default(),
                dirty: true,
            })),
            running: Arc::new(AtomicBool::new(false)),
            codec: Arc::new(Mutex::new(Some(codec))),
            helpers,
            worker: None,
        }
    }

    /// Start the DSP worker. Fails if the engine is already running.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("start requested while already running");
            return Err(EngineError::AlreadyRunning);
        }

        info!("starting audio engine");
        {
            let mut shared = lock_shared(&self.shared);
            shared.dirty = true;
            shared.levels = Levels::default();
        }

        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let codec = Arc::clone(&self.codec);
        let helpers = Arc::clone(&self.helpers);

        let handle = std::thread::Builder::new()
            .name("auricle-dsp".into())
            .spawn(move || worker_main(shared, running, codec, helpers))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                EngineError::Spawn(e.to_string())
            })?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Stop the worker and wait for it to exit. The worker mutes the codec
    /// and re-enables the speaker amplifier on its way out.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replace the whole parameter record (clamped on ingest).
    pub fn set_params(&self, params: EngineParams) {
        self.update(|p| *p = params);
    }

    /// Snapshot of the current parameters.
    pub fn params(&self) -> EngineParams {
        lock_shared(&self.shared).params
    }

    /// Latest level readout.
    pub fn levels(&self) -> Levels {
        lock_shared(&self.shared).levels
    }

    fn update(&self, mutate: impl FnOnce(&mut EngineParams)) {
        let mut shared = lock_shared(&self.shared);
        mutate(&mut shared.params);
        shared.params.sanitize();
        shared.dirty = true;
    }

    // Per-field setters. All inputs are clamped to the ranges documented on
    // `EngineParams`.

    pub fn set_mic_gain(&self, gain: f32) {
        self.update(|p| p.mic_gain = gain);
    }

    pub fn set_hpf(&self, enabled: bool, frequency: f32) {
        self.update(|p| {
            p.hpf.enabled = enabled;
            p.hpf.frequency = frequency;
        });
    }

    pub fn set_lpf(&self, enabled: bool, frequency: f32) {
        self.update(|p| {
            p.lpf.enabled = enabled;
            p.lpf.frequency = frequency;
        });
    }

    pub fn set_eq_low(&self, gain_db: f32) {
        self.update(|p| p.eq.low_gain_db = gain_db);
    }

    pub fn set_eq_mid(&self, gain_db: f32) {
        self.update(|p| p.eq.mid_gain_db = gain_db);
    }

    pub fn set_eq_high(&self, gain_db: f32) {
        self.update(|p| p.eq.high_gain_db = gain_db);
    }

    pub fn set_ns_enabled(&self, enabled: bool) {
        self.update(|p| p.ns.enabled = enabled);
    }

    pub fn set_ns_mode(&self, mode: u8) {
        self.update(|p| p.ns.mode = mode);
    }

    pub fn set_agc_enabled(&self, enabled: bool) {
        self.update(|p| p.agc.enabled = enabled);
    }

    pub fn set_agc_mode(&self, mode: u8) {
        self.update(|p| p.agc.mode = mode);
    }

    pub fn set_agc_compression_gain(&self, gain_db: u8) {
        self.update(|p| p.agc.compression_gain_db = gain_db);
    }

    pub fn set_agc_limiter(&self, enabled: bool) {
        self.update(|p| p.agc.limiter_enabled = enabled);
    }

    pub fn set_agc_target_level(&self, dbfs: i8) {
        self.update(|p| p.agc.target_level_dbfs = dbfs);
    }

    pub fn set_ve_enabled(&self, enabled: bool) {
        self.update(|p| p.voice_exclusion.enabled = enabled);
    }

    pub fn set_ve_mode(&self, mode: VeMode) {
        self.update(|p| p.voice_exclusion.mode = mode);
    }

    pub fn set_ve_blend(&self, blend: f32) {
        self.update(|p| p.voice_exclusion.blend = blend);
    }

    pub fn set_ve_step_size(&self, step: f32) {
        self.update(|p| p.voice_exclusion.step_size = step);
    }

    pub fn set_ve_filter_length(&self, taps: usize) {
        self.update(|p| p.voice_exclusion.filter_length = taps);
    }

    pub fn set_ve_max_attenuation(&self, attenuation: f32) {
        self.update(|p| p.voice_exclusion.max_attenuation = attenuation);
    }

    pub fn set_ve_ref_gain(&self, gain: f32) {
        self.update(|p| p.voice_exclusion.ref_gain = gain);
    }

    pub fn set_ve_ref_hpf(&self, frequency: f32) {
        self.update(|p| p.voice_exclusion.ref_hpf = frequency);
    }

    pub fn set_ve_ref_lpf(&self, frequency: f32) {
        self.update(|p| p.voice_exclusion.ref_lpf = frequency);
    }

    pub fn set_ve_aec_mode(&self, mode: u8) {
        self.update(|p| p.voice_exclusion.aec_mode = mode);
    }

    pub fn set_ve_aec_filter_length(&self, filter_len: u8) {
        self.update(|p| p.voice_exclusion.aec_filter_len = filter_len);
    }

    pub fn set_ve_vad_enabled(&self, enabled: bool) {
        self.update(|p| p.voice_exclusion.vad_enabled = enabled);
    }

    pub fn set_ve_vad_mode(&self, mode: u8) {
        self.update(|p| p.voice_exclusion.vad_mode = mode);
    }

    pub fn set_ve_vad_gate(&self, enabled: bool, attenuation: f32) {
        self.update(|p| {
            p.voice_exclusion.vad_gate_enabled = enabled;
            p.voice_exclusion.vad_gate_attenuation = attenuation;
        });
    }

    pub fn set_output_gain(&self, gain: f32) {
        self.update(|p| p.output.gain = gain);
    }

    pub fn set_output_volume(&self, volume: u8) {
        self.update(|p| p.output.volume = volume);
    }

    pub fn set_mute(&self, mute: bool) {
        self.update(|p| p.output.mute = mute);
    }

    pub fn set_boost_enabled(&self, enabled: bool) {
        self.update(|p| p.output.boost_enabled = enabled);
    }

    pub fn set_notch(&self, index: usize, notch: crate::dsp::tinnitus::NotchParams) {
        self.update(|p| {
            if let Some(slot) = p.tinnitus.notches.get_mut(index) {
                *slot = notch;
            }
        });
    }

    pub fn set_notch_stage(&self, stage: NotchStage) {
        self.update(|p| p.tinnitus.notch_stage = stage);
    }

    pub fn set_masking_noise(&self, masking: crate::dsp::tinnitus::MaskingParams) {
        self.update(|p| p.tinnitus.masking = masking);
    }

    pub fn set_tone_finder(&self, tone: crate::dsp::tinnitus::ToneParams) {
        self.update(|p| p.tinnitus.tone = tone);
    }

    pub fn set_hf_extension(&self, hf: crate::dsp::tinnitus::HfExtensionParams) {
        self.update(|p| p.tinnitus.hf_extension = hf);
    }

    pub fn set_binaural(&self, binaural: crate::dsp::tinnitus::BinauralParams) {
        self.update(|p| p.tinnitus.binaural = binaural);
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker thread entry: raise priority, claim the codec, run the loop with
/// denormals flushed to zero, and hand the codec back on exit.
fn worker_main(
    shared: Arc<Mutex<SharedState>>,
    running: Arc<AtomicBool>,
    codec_slot: Arc<Mutex<Option<Box<dyn Codec>>>>,
    helpers: Arc<dyn HelperSuite>,
) {
    if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
        warn!("could not set DSP thread priority: {e:?}");
    }

    let taken = match codec_slot.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    let Some(mut codec) = taken else {
        error!("no codec handle at worker entry; engine stopped");
        running.store(false, Ordering::SeqCst);
        return;
    };

    if let Err(e) = codec.reconfigure(SAMPLE_RATE, 16, true) {
        error!("codec reconfigure failed: {e}; engine stopped");
        running.store(false, Ordering::SeqCst);
        restore_codec(&codec_slot, codec);
        return;
    }

    // Start muted with the speaker amp off so nothing leaks into the mics.
    codec.set_mute(true);
    codec.set_speaker_enabled(false);

    info!("audio worker started");

    // SAFETY: only alters this thread's floating-point control flags.
    let codec = unsafe {
        no_denormals::no_denormals(move || {
            let mut worker = Box::new(Worker::new(shared, running, codec, helpers));
            worker.run();
            let worker = *worker;
            worker.teardown()
        })
    };

    restore_codec(&codec_slot, codec);
    info!("audio worker exited");
}

fn restore_codec(slot: &Mutex<Option<Box<dyn Codec>>>, codec: Box<dyn Codec>) {
    match slot.lock() {
        Ok(mut slot) => *slot = Some(codec),
        Err(poisoned) => *poisoned.into_inner() = Some(codec),
    }
}

/// Everything the worker owns exclusively: filter state, resampler state,
/// helper handles, and the block buffers. Allocated at start; the steady
/// state performs no heap allocation.
struct Worker {
    shared: Arc<Mutex<SharedState>>,
    running: Arc<AtomicBool>,
    codec: Box<dyn Codec>,
    helpers: Arc<dyn HelperSuite>,

    params: EngineParams,

    // Per-channel filter chains (index 0 = left, 1 = right).
    hpf: [Biquad; 2],
    lpf: [Biquad; 2],
    eq_low: [Biquad; 2],
    eq_mid: [Biquad; 2],
    eq_high: [Biquad; 2],
    // Mono reference conditioning chain.
    ref_hpf: Biquad,
    ref_lpf: Biquad,

    tinnitus: TinnitusLayer,

    meter_left: ChannelMeter,
    meter_right: ChannelMeter,
    meter_hp: ChannelMeter,
    vad_speech: bool,

    // Helper handles, opened on demand.
    ns_left: Option<Box<dyn NsProcessor>>,
    ns_right: Option<Box<dyn NsProcessor>>,
    agc_left: Option<Box<dyn AgcProcessor>>,
    agc_right: Option<Box<dyn AgcProcessor>>,
    aec_left: Option<Box<dyn AecProcessor>>,
    aec_right: Option<Box<dyn AecProcessor>>,
    vad: Option<Box<dyn VadDetector>>,
    nlms_left: Option<NlmsFilter>,
    nlms_right: Option<NlmsFilter>,

    // Identity-defining parameters behind the currently open handles.
    prev_ns: Option<u8>,
    prev_agc: Option<u8>,
    prev_agc_config: (u8, bool, i8),
    prev_nlms_len: Option<usize>,
    prev_aec: Option<(u8, u8)>,
    prev_vad: Option<u8>,

    // One resampler set per path; state is never shared between paths.
    ns_down: [Downsampler3; 2],
    ns_up: [Upsampler3; 2],
    agc_down: [Downsampler3; 2],
    agc_up: [Upsampler3; 2],
    ve_down: [Downsampler3; 3],
    ve_up: [Upsampler3; 2],
    aec_down: [Downsampler3; 3],
    aec_up: [Upsampler3; 2],
    bridge: AecFrameBridge,

    headphone_present: bool,
    hp_poll_countdown: u32,

    // Suppress repeated per-block helper error logs.
    ns_warned: bool,
    agc_warned: bool,
    aec_warned: bool,
    vad_warned: bool,

    // Block buffers.
    in_pcm: Vec<i16>,
    out_pcm: Vec<i16>,
    left: Vec<f32>,
    right: Vec<f32>,
    reference: Vec<f32>,
    scratch16_a: [f32; NS_FRAME],
    scratch16_b: [f32; NS_FRAME],
    scratch16_c: [f32; NS_FRAME],
    est16_left: [f32; NS_FRAME],
    est16_right: [f32; NS_FRAME],
    wet_left: Vec<f32>,
    wet_right: Vec<f32>,
    helper_in: [i16; NS_FRAME],
    helper_out: [i16; NS_FRAME],
    aec_frame_left: [i16; AEC_FRAME],
    aec_frame_right: [i16; AEC_FRAME],
    aec_frame_ref: [i16; AEC_FRAME],
    aec_out_left: [i16; AEC_FRAME],
    aec_out_right: [i16; AEC_FRAME],
}

impl Worker {
    fn new(
        shared: Arc<Mutex<SharedState>>,
        running: Arc<AtomicBool>,
        codec: Box<dyn Codec>,
        helpers: Arc<dyn HelperSuite>,
    ) -> Self {
        Self {
            shared,
            running,
            codec,
            helpers,
            params: EngineParams::default(),
            hpf: Default::default(),
            lpf: Default::default(),
            eq_low: Default::default(),
            eq_mid: Default::default(),
            eq_high: Default::default(),
            ref_hpf: Biquad::default(),
            ref_lpf: Biquad::default(),
            tinnitus: TinnitusLayer::new(SAMPLE_RATE as f32),
            meter_left: ChannelMeter::new(),
            meter_right: ChannelMeter::new(),
            meter_hp: ChannelMeter::new(),
            vad_speech: false,
            ns_left: None,
            ns_right: None,
            agc_left: None,
            agc_right: None,
            aec_left: None,
            aec_right: None,
            vad: None,
            nlms_left: None,
            nlms_right: None,
            prev_ns: None,
            prev_agc: None,
            prev_agc_config: (0, false, 0),
            prev_nlms_len: None,
            prev_aec: None,
            prev_vad: None,
            ns_down: Default::default(),
            ns_up: Default::default(),
            agc_down: Default::default(),
            agc_up: Default::default(),
            ve_down: Default::default(),
            ve_up: Default::default(),
            aec_down: Default::default(),
            aec_up: Default::default(),
            bridge: AecFrameBridge::new(),
            headphone_present: false,
            hp_poll_countdown: 0,
            ns_warned: false,
            agc_warned: false,
            aec_warned: false,
            vad_warned: false,
            in_pcm: vec![0; BLOCK_SIZE * NUM_CHANNELS_IN],
            out_pcm: vec![0; BLOCK_SIZE * NUM_CHANNELS_OUT],
            left: vec![0.0; BLOCK_SIZE],
            right: vec![0.0; BLOCK_SIZE],
            reference: vec![0.0; BLOCK_SIZE],
            scratch16_a: [0.0; NS_FRAME],
            scratch16_b: [0.0; NS_FRAME],
            scratch16_c: [0.0; NS_FRAME],
            est16_left: [0.0; NS_FRAME],
            est16_right: [0.0; NS_FRAME],
            wet_left: vec![0.0; BLOCK_SIZE],
            wet_right: vec![0.0; BLOCK_SIZE],
            helper_in: [0; NS_FRAME],
            helper_out: [0; NS_FRAME],
            aec_frame_left: [0; AEC_FRAME],
            aec_frame_right: [0; AEC_FRAME],
            aec_frame_ref: [0; AEC_FRAME],
            aec_out_left: [0; AEC_FRAME],
            aec_out_right: [0; AEC_FRAME],
        }
    }

    fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            // Snapshot parameters at the block boundary; changes submitted
            // mid-block become visible on the next iteration.
            let snapshot = {
                let mut shared = lock_shared(&self.shared);
                if shared.dirty {
                    shared.dirty = false;
                    Some(shared.params)
                } else {
                    None
                }
            };
            if let Some(params) = snapshot {
                self.apply_params(params);
            }

            self.process_block();
        }
    }

    fn teardown(mut self) -> Box<dyn Codec> {
        self.codec.set_mute(true);
        self.codec.set_speaker_enabled(true);
        self.codec
    }

    /// Apply a fresh parameter snapshot: codec controls, helper handle
    /// lifecycle, and all filter coefficients. This is the only place the
    /// steady-state loop may allocate.
    fn apply_params(&mut self, params: EngineParams) {
        self.params = params;
        let p = self.params;

        self.codec.set_input_gain(p.mic_gain);
        self.codec.set_volume(p.output.volume);
        self.codec.set_mute(p.output.mute);

        self.update_ns_handles();
        self.update_agc_handles();
        self.update_ve_state();
        self.rebuild_coefficients();

        info!(
            "params applied: micGain={:.0} vol={} mute={} hpf={}/{:.0}Hz lpf={}/{:.0}Hz \
             eq={:.1}/{:.1}/{:.1}dB ns={}/{} agc={}/{} ve={}/{:?} blend={:.2} gain={:.2} boost={}",
            p.mic_gain,
            p.output.volume,
            p.output.mute,
            p.hpf.enabled,
            p.hpf.frequency,
            p.lpf.enabled,
            p.lpf.frequency,
            p.eq.low_gain_db,
            p.eq.mid_gain_db,
            p.eq.high_gain_db,
            p.ns.enabled,
            p.ns.mode,
            p.agc.enabled,
            p.agc.mode,
            p.voice_exclusion.enabled,
            p.voice_exclusion.mode,
            p.voice_exclusion.blend,
            p.output.gain,
            p.output.boost_enabled,
        );
    }

    fn update_ns_handles(&mut self) {
        let wanted = self.params.ns.enabled.then_some(self.params.ns.mode);
        if wanted == self.prev_ns {
            return;
        }
        self.ns_left = None;
        self.ns_right = None;
        self.ns_warned = false;

        if let Some(mode) = wanted {
            match (
                self.helpers.create_ns(NS_FRAME, mode),
                self.helpers.create_ns(NS_FRAME, mode),
            ) {
                (Ok(left), Ok(right)) => {
                    self.ns_left = Some(left);
                    self.ns_right = Some(right);
                    info!("NS handles created (mode={mode})");
                }
                (Err(e), _) | (_, Err(e)) => {
                    error!("NS unavailable, feature disabled: {e}");
                }
            }
        }
        self.prev_ns = wanted;
    }

    fn update_agc_handles(&mut self) {
        let p = self.params.agc;
        let wanted = p.enabled.then_some(p.mode);
        let config = (p.compression_gain_db, p.limiter_enabled, p.target_level_dbfs);

        if wanted != self.prev_agc {
            self.agc_left = None;
            self.agc_right = None;
            self.agc_warned = false;

            if let Some(mode) = wanted {
                match (self.helpers.create_agc(mode), self.helpers.create_agc(mode)) {
                    (Ok(left), Ok(right)) => {
                        self.agc_left = Some(left);
                        self.agc_right = Some(right);
                        info!("AGC handles created (mode={mode})");
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        error!("AGC unavailable, feature disabled: {e}");
                    }
                }
            }
            self.prev_agc = wanted;
            // Force the config push onto fresh handles.
            self.prev_agc_config = (u8::MAX, false, i8::MIN);
        }

        if config != self.prev_agc_config {
            for handle in [self.agc_left.as_mut(), self.agc_right.as_mut()]
                .into_iter()
                .flatten()
            {
                if let Err(e) = handle.set_config(config.0, config.1, config.2) {
                    warn!("AGC config rejected: {e}");
                }
            }
            self.prev_agc_config = config;
        }
    }

    fn update_ve_state(&mut self) {
        let ve = self.params.voice_exclusion;

        // NLMS cancellers: reallocated only when the filter length changes.
        let wanted_nlms =
            (ve.enabled && ve.mode == VeMode::Nlms).then_some(ve.filter_length);
        if wanted_nlms != self.prev_nlms_len {
            if let Some(len) = wanted_nlms {
                self.nlms_left = Some(NlmsFilter::new(len));
                self.nlms_right = Some(NlmsFilter::new(len));
                for d in self.ve_down.iter_mut() {
                    d.reset();
                }
                for u in self.ve_up.iter_mut() {
                    u.reset();
                }
                info!("NLMS filters created (taps={len})");
            } else {
                self.nlms_left = None;
                self.nlms_right = None;
            }
            self.prev_nlms_len = wanted_nlms;
        }

        // External AEC: identity is (mode, filter length in blocks).
        let wanted_aec =
            (ve.enabled && ve.mode == VeMode::Aec).then_some((ve.aec_mode, ve.aec_filter_len));
        if wanted_aec != self.prev_aec {
            self.aec_left = None;
            self.aec_right = None;
            self.aec_warned = false;
            self.bridge.reset();
            for d in self.aec_down.iter_mut() {
                d.reset();
            }
            for u in self.aec_up.iter_mut() {
                u.reset();
            }

            if let Some((mode, filter_len)) = wanted_aec {
                match (
                    self.helpers.create_aec(filter_len, mode),
                    self.helpers.create_aec(filter_len, mode),
                ) {
                    (Ok(left), Ok(right)) => {
                        self.aec_left = Some(left);
                        self.aec_right = Some(right);
                        info!("AEC handles created (mode={mode} filterLen={filter_len})");
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        error!("AEC unavailable, feature disabled: {e}");
                    }
                }
            }
            self.prev_aec = wanted_aec;
        }

        // VAD gates the AEC path only.
        let wanted_vad =
            (ve.enabled && ve.mode == VeMode::Aec && ve.vad_enabled).then_some(ve.vad_mode);
        if wanted_vad != self.prev_vad {
            self.vad = None;
            self.vad_warned = false;
            if let Some(mode) = wanted_vad {
                match self.helpers.create_vad(mode) {
                    Ok(vad) => {
                        self.vad = Some(vad);
                        info!("VAD handle created (mode={mode})");
                    }
                    Err(e) => error!("VAD unavailable: {e}"),
                }
            }
            self.prev_vad = wanted_vad;
        }
    }

    fn rebuild_coefficients(&mut self) {
        let fs = SAMPLE_RATE as f64;
        let p = &self.params;

        let hpf = Coeffs::high_pass(p.hpf.frequency as f64, fs);
        let lpf = Coeffs::low_pass(p.lpf.frequency as f64, fs);
        let eq_low = Coeffs::peaking(EQ_FREQUENCIES[0] as f64, p.eq.low_gain_db as f64, EQ_Q as f64, fs);
        let eq_mid = Coeffs::peaking(EQ_FREQUENCIES[1] as f64, p.eq.mid_gain_db as f64, EQ_Q as f64, fs);
        let eq_high = Coeffs::peaking(EQ_FREQUENCIES[2] as f64, p.eq.high_gain_db as f64, EQ_Q as f64, fs);
        for ch in 0..2 {
            self.hpf[ch].set_coeffs(hpf);
            self.lpf[ch].set_coeffs(lpf);
            self.eq_low[ch].set_coeffs(eq_low);
            self.eq_mid[ch].set_coeffs(eq_mid);
            self.eq_high[ch].set_coeffs(eq_high);
        }

        let ve = &p.voice_exclusion;
        self.ref_hpf.set_coeffs(Coeffs::high_pass(ve.ref_hpf as f64, fs));
        self.ref_lpf.set_coeffs(Coeffs::low_pass(ve.ref_lpf as f64, fs));

        self.tinnitus.configure(&p.tinnitus);
    }

    /// One pipeline iteration: read, enhance, synthesize, meter, write.
    fn process_block(&mut self) {
        let samples = match self.codec.read(&mut self.in_pcm) {
            Ok(n) => n,
            Err(e) => {
                warn!("codec read failed: {e}");
                return;
            }
        };
        let frames = (samples / NUM_CHANNELS_IN).min(BLOCK_SIZE);
        if frames == 0 {
            // Transient short read: retry on the next iteration.
            return;
        }

        // Deinterleave mic L (ch0), mic R (ch2), boom reference (ch3).
        const SCALE: f32 = 1.0 / 32768.0;
        for i in 0..frames {
            self.left[i] = self.in_pcm[i * NUM_CHANNELS_IN] as f32 * SCALE;
            self.right[i] = self.in_pcm[i * NUM_CHANNELS_IN + 2] as f32 * SCALE;
            self.reference[i] = self.in_pcm[i * NUM_CHANNELS_IN + 3] as f32 * SCALE;
        }

        if self.params.hpf.enabled {
            self.hpf[0].process_block(&mut self.left[..frames]);
            self.hpf[1].process_block(&mut self.right[..frames]);
        }
        if self.params.lpf.enabled {
            self.lpf[0].process_block(&mut self.left[..frames]);
            self.lpf[1].process_block(&mut self.right[..frames]);
        }

        if self.tinnitus.notch_stage() == NotchStage::PreEq {
            self.tinnitus
                .process_notches(&mut self.left[..frames], &mut self.right[..frames]);
        }

        self.eq_low[0].process_block(&mut self.left[..frames]);
        self.eq_low[1].process_block(&mut self.right[..frames]);
        self.eq_mid[0].process_block(&mut self.left[..frames]);
        self.eq_mid[1].process_block(&mut self.right[..frames]);
        self.eq_high[0].process_block(&mut self.left[..frames]);
        self.eq_high[1].process_block(&mut self.right[..frames]);

        // Reference conditioning: gain then band-pass, so the cancellers see
        // a clean voice band.
        let ref_gain = self.params.voice_exclusion.ref_gain;
        for sample in self.reference[..frames].iter_mut() {
            *sample *= ref_gain;
        }
        self.ref_hpf.process_block(&mut self.reference[..frames]);
        self.ref_lpf.process_block(&mut self.reference[..frames]);

        let (hp_rms, hp_peak) = self.meter_hp.update(&self.reference[..frames]);

        // Headphone probe, cached between polls. Without a headphone the
        // boom reference is meaningless, so voice exclusion is skipped.
        if self.hp_poll_countdown == 0 {
            self.headphone_present = self.codec.headphone_detected();
            self.hp_poll_countdown = HP_DETECT_INTERVAL;
        }
        self.hp_poll_countdown -= 1;

        if self.params.voice_exclusion.enabled
            && self.headphone_present
            && frames == BLOCK_SIZE
        {
            match self.params.voice_exclusion.mode {
                VeMode::Nlms => self.run_voice_exclusion_nlms(),
                VeMode::Aec => self.run_voice_exclusion_aec(),
            }
        }

        if self.params.ns.enabled && frames == BLOCK_SIZE {
            self.run_noise_suppression();
        }

        if self.params.agc.enabled && frames == BLOCK_SIZE {
            self.run_agc();
        }

        if self.tinnitus.notch_stage() == NotchStage::PostEq {
            self.tinnitus
                .process_notches(&mut self.left[..frames], &mut self.right[..frames]);
        }
        self.tinnitus
            .process_synthesis(&mut self.left[..frames], &mut self.right[..frames]);

        self.apply_output_gain(frames);

        let (rms_left, peak_left) = self.meter_left.update(&self.left[..frames]);
        let (rms_right, peak_right) = self.meter_right.update(&self.right[..frames]);
        {
            let mut shared = lock_shared(&self.shared);
            let levels = &mut shared.levels;
            levels.rms_left = rms_left;
            levels.rms_right = rms_right;
            levels.peak_left = peak_left;
            levels.peak_right = peak_right;
            levels.rms_hp = hp_rms;
            levels.peak_hp = hp_peak;
            levels.vad_speech_detected = self.vad_speech;
        }

        for i in 0..frames {
            self.out_pcm[i * NUM_CHANNELS_OUT] = f32_to_i16(self.left[i]);
            self.out_pcm[i * NUM_CHANNELS_OUT + 1] = f32_to_i16(self.right[i]);
        }
        // Mute zeroes the produced block after metering, so the meters keep
        // showing pre-mute energy.
        if self.params.output.mute {
            self.out_pcm[..frames * NUM_CHANNELS_OUT].fill(0);
        }
        if let Err(e) = self.codec.write(&self.out_pcm[..frames * NUM_CHANNELS_OUT]) {
            warn!("codec write failed: {e}");
        }
    }

    fn run_voice_exclusion_nlms(&mut self) {
        let ve = self.params.voice_exclusion;
        self.ve_down[0].process(&self.left[..BLOCK_SIZE], &mut self.scratch16_a);
        self.ve_down[1].process(&self.right[..BLOCK_SIZE], &mut self.scratch16_b);
        self.ve_down[2].process(&self.reference[..BLOCK_SIZE], &mut self.scratch16_c);

        let (Some(nlms_left), Some(nlms_right)) =
            (self.nlms_left.as_mut(), self.nlms_right.as_mut())
        else {
            return;
        };
        for i in 0..NS_FRAME {
            self.est16_left[i] =
                nlms_left.process(self.scratch16_c[i], self.scratch16_a[i], ve.step_size);
            self.est16_right[i] =
                nlms_right.process(self.scratch16_c[i], self.scratch16_b[i], ve.step_size);
        }

        self.ve_up[0].process(&self.est16_left, &mut self.wet_left[..BLOCK_SIZE]);
        self.ve_up[1].process(&self.est16_right, &mut self.wet_right[..BLOCK_SIZE]);

        for i in 0..BLOCK_SIZE {
            // The removal is bounded relative to the signal so the canceller
            // can never gouge more than `max_attenuation` of it.
            let bound_left = self.left[i].abs() * ve.max_attenuation;
            let bound_right = self.right[i].abs() * ve.max_attenuation;
            let removal_left = self.wet_left[i].clamp(-bound_left, bound_left);
            let removal_right = self.wet_right[i].clamp(-bound_right, bound_right);

            let left = self.left[i] - ve.blend * removal_left;
            let right = self.right[i] - ve.blend * removal_right;
            self.left[i] = if left.is_finite() { left } else { 0.0 };
            self.right[i] = if right.is_finite() { right } else { 0.0 };
        }
    }

    fn run_voice_exclusion_aec(&mut self) {
        if self.aec_left.is_none() || self.aec_right.is_none() {
            return;
        }
        let ve = self.params.voice_exclusion;

        self.aec_down[0].process(&self.left[..BLOCK_SIZE], &mut self.scratch16_a);
        self.aec_down[1].process(&self.right[..BLOCK_SIZE], &mut self.scratch16_b);
        self.aec_down[2].process(&self.reference[..BLOCK_SIZE], &mut self.scratch16_c);
        self.bridge
            .push(&self.scratch16_a, &self.scratch16_b, &self.scratch16_c);

        while self.bridge.frame_ready() {
            if !self.bridge.pop_frame(
                &mut self.aec_frame_left,
                &mut self.aec_frame_right,
                &mut self.aec_frame_ref,
            ) {
                break;
            }

            if let Some(vad) = self.vad.as_mut() {
                match vad.is_speech(&self.aec_frame_ref) {
                    Ok(speech) => self.vad_speech = speech,
                    Err(e) => {
                        if !self.vad_warned {
                            warn!("VAD failed: {e}");
                            self.vad_warned = true;
                        }
                    }
                }
            }

            let (Some(aec_left), Some(aec_right)) =
                (self.aec_left.as_mut(), self.aec_right.as_mut())
            else {
                return;
            };
            let result = aec_left
                .process(
                    &self.aec_frame_left,
                    &self.aec_frame_ref,
                    &mut self.aec_out_left,
                )
                .and_then(|()| {
                    aec_right.process(
                        &self.aec_frame_right,
                        &self.aec_frame_ref,
                        &mut self.aec_out_right,
                    )
                });
            match result {
                Ok(()) => self
                    .bridge
                    .push_output(&self.aec_out_left, &self.aec_out_right),
                Err(e) => {
                    if !self.aec_warned {
                        warn!("AEC failed, passing dry signal: {e}");
                        self.aec_warned = true;
                    }
                }
            }
        }

        // No output until the helper has digested a full 512-sample frame;
        // until then the block passes through unblended.
        if self
            .bridge
            .drain_output(&mut self.scratch16_a, &mut self.scratch16_b)
        {
            self.aec_up[0].process(&self.scratch16_a, &mut self.wet_left[..BLOCK_SIZE]);
            self.aec_up[1].process(&self.scratch16_b, &mut self.wet_right[..BLOCK_SIZE]);

            // The VAD gate attenuates the cancelled path before the blend so
            // suppressed energy is not re-introduced.
            let gate = if ve.vad_gate_enabled && self.vad_speech {
                1.0 - ve.vad_gate_attenuation
            } else {
                1.0
            };
            for i in 0..BLOCK_SIZE {
                let wet_left = self.wet_left[i] * gate;
                let wet_right = self.wet_right[i] * gate;
                let left = (1.0 - ve.blend) * self.left[i] + ve.blend * wet_left;
                let right = (1.0 - ve.blend) * self.right[i] + ve.blend * wet_right;
                self.left[i] = if left.is_finite() { left } else { 0.0 };
                self.right[i] = if right.is_finite() { right } else { 0.0 };
            }
        }
    }

    fn run_noise_suppression(&mut self) {
        if let Some(ns) = self.ns_left.as_mut() {
            let result = helper_channel_16k(
                &mut self.ns_down[0],
                &mut self.ns_up[0],
                &mut self.scratch16_a,
                &mut self.helper_in,
                &mut self.helper_out,
                &mut self.left[..BLOCK_SIZE],
                |input, output| ns.process(input, output),
            );
            if let Err(e) = result {
                if !self.ns_warned {
                    warn!("NS failed on left channel: {e}");
                    self.ns_warned = true;
                }
            }
        }
        if let Some(ns) = self.ns_right.as_mut() {
            let result = helper_channel_16k(
                &mut self.ns_down[1],
                &mut self.ns_up[1],
                &mut self.scratch16_a,
                &mut self.helper_in,
                &mut self.helper_out,
                &mut self.right[..BLOCK_SIZE],
                |input, output| ns.process(input, output),
            );
            if let Err(e) = result {
                if !self.ns_warned {
                    warn!("NS failed on right channel: {e}");
                    self.ns_warned = true;
                }
            }
        }
    }

    fn run_agc(&mut self) {
        if let Some(agc) = self.agc_left.as_mut() {
            let result = helper_channel_16k(
                &mut self.agc_down[0],
                &mut self.agc_up[0],
                &mut self.scratch16_a,
                &mut self.helper_in,
                &mut self.helper_out,
                &mut self.left[..BLOCK_SIZE],
                |input, output| agc.process(input, output),
            );
            if let Err(e) = result {
                if !self.agc_warned {
                    warn!("AGC failed on left channel: {e}");
                    self.agc_warned = true;
                }
            }
        }
        if let Some(agc) = self.agc_right.as_mut() {
            let result = helper_channel_16k(
                &mut self.agc_down[1],
                &mut self.agc_up[1],
                &mut self.scratch16_a,
                &mut self.helper_in,
                &mut self.helper_out,
                &mut self.right[..BLOCK_SIZE],
                |input, output| agc.process(input, output),
            );
            if let Err(e) = result {
                if !self.agc_warned {
                    warn!("AGC failed on right channel: {e}");
                    self.agc_warned = true;
                }
            }
        }
    }

    fn apply_output_gain(&mut self, frames: usize) {
        let gain = self.params.output.gain;
        // Boost above unity runs through a soft saturator instead of letting
        // the final clamp produce hard-clip discontinuities.
        let soft = self.params.output.boost_enabled && gain > 1.0;
        for channel in [&mut self.left[..frames], &mut self.right[..frames]] {
            if soft {
                for sample in channel.iter_mut() {
                    *sample = (gain * *sample).tanh();
                }
            } else {
                for sample in channel.iter_mut() {
                    *sample *= gain;
                }
            }
        }
    }
}

/// Ship one 48 kHz channel through a 16 kHz helper: decimate, convert to
/// PCM, process, convert back, interpolate. On helper failure the channel
/// is left untouched.
fn helper_channel_16k(
    down: &mut Downsampler3,
    up: &mut Upsampler3,
    scratch: &mut [f32; NS_FRAME],
    pcm_in: &mut [i16; NS_FRAME],
    pcm_out: &mut [i16; NS_FRAME],
    samples: &mut [f32],
    mut process: impl FnMut(&[i16], &mut [i16]) -> Result<(), HelperError>,
) -> Result<(), HelperError> {
    down.process(samples, scratch);
    for (dst, &src) in pcm_in.iter_mut().zip(scratch.iter()) {
        *dst = f32_to_i16(src);
    }
    process(pcm_in, pcm_out)?;
    for (dst, &src) in scratch.iter_mut().zip(pcm_out.iter()) {
        *dst = i16_to_f32(src);
    }
    up.process(scratch, samples);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::codec::CodecError;
    use crate::engine::helpers::NullHelperSuite;
    use std::time::Duration;

    /// Codec that never delivers audio; read short-reads so the worker can
    /// observe the running flag.
    struct IdleCodec;

    impl Codec for IdleCodec {
        fn reconfigure(&mut self, _: u32, _: u16, _: bool) -> Result<(), CodecError> {
            Ok(())
        }
        fn read(&mut self, _: &mut [i16]) -> Result<usize, CodecError> {
            std::thread::sleep(Duration::from_millis(1));
            Ok(0)
        }
        fn write(&mut self, buf: &[i16]) -> Result<usize, CodecError> {
            Ok(buf.len())
        }
        fn set_input_gain(&mut self, _: f32) {}
        fn set_volume(&mut self, _: u8) {}
        fn set_mute(&mut self, _: bool) {}
        fn set_speaker_enabled(&mut self, _: bool) {}
        fn headphone_detected(&mut self) -> bool {
            false
        }
    }

    /// Codec whose reconfigure always fails.
    struct BrokenCodec;

    impl Codec for BrokenCodec {
        fn reconfigure(&mut self, _: u32, _: u16, _: bool) -> Result<(), CodecError> {
            Err(CodecError::Reconfigure("no i2s clock".into()))
        }
        fn read(&mut self, _: &mut [i16]) -> Result<usize, CodecError> {
            Ok(0)
        }
        fn write(&mut self, buf: &[i16]) -> Result<usize, CodecError> {
            Ok(buf.len())
        }
        fn set_input_gain(&mut self, _: f32) {}
        fn set_volume(&mut self, _: u8) {}
        fn set_mute(&mut self, _: bool) {}
        fn set_speaker_enabled(&mut self, _: bool) {}
        fn headphone_detected(&mut self) -> bool {
            false
        }
    }

    #[test]
    fn test_start_stop_cycle() {
        let mut engine = AudioEngine::new(Box::new(IdleCodec), Arc::new(NullHelperSuite));
        assert!(!engine.is_running());

        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));

        engine.stop();
        assert!(!engine.is_running());

        // The codec is handed back, so a second session works.
        engine.start().unwrap();
        assert!(engine.is_running());
        engine.stop();
    }

    #[test]
    fn test_stop_when_not_running_is_noop() {
        let mut engine = AudioEngine::new(Box::new(IdleCodec), Arc::new(NullHelperSuite));
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_fatal_codec_failure_marks_engine_stopped() {
        let mut engine = AudioEngine::new(Box::new(BrokenCodec), Arc::new(NullHelperSuite));
        engine.start().unwrap();
        // The worker exits on its own and clears the running flag.
        for _ in 0..200 {
            if !engine.is_running() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!engine.is_running());
    }

    #[test]
    fn test_set_params_round_trips_after_clamping() {
        let engine = AudioEngine::new(Box::new(IdleCodec), Arc::new(NullHelperSuite));
        let mut wanted = EngineParams::default();
        wanted.mic_gain = 9999.0;
        wanted.output.gain = 2.5;
        wanted.eq.low_gain_db = -3.0;
        engine.set_params(wanted);

        let stored = engine.params();
        assert_eq!(stored, wanted.sanitized());
        assert_eq!(stored.mic_gain, 240.0);
        assert_eq!(stored.output.gain, 2.5);
    }

    #[test]
    fn test_setters_clamp_individual_fields() {
        let engine = AudioEngine::new(Box::new(IdleCodec), Arc::new(NullHelperSuite));
        engine.set_hpf(true, 5.0);
        engine.set_ve_blend(7.0);
        engine.set_output_volume(200);
        let p = engine.params();
        assert_eq!(p.hpf.frequency, 20.0);
        assert_eq!(p.voice_exclusion.blend, 1.0);
        assert_eq!(p.output.volume, 100);
    }

    #[test]
    fn test_levels_default_until_worker_publishes() {
        let engine = AudioEngine::new(Box::new(IdleCodec), Arc::new(NullHelperSuite));
        let levels = engine.levels();
        assert_eq!(levels.rms_left, 0.0);
        assert!(!levels.vad_speech_detected);
    }
}
