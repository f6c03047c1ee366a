//! Engine parameter record, level snapshot, and range clamping.
//!
//! Parameters are a single flat record shared between the control surface
//! and the DSP worker. Every ingest path runs [`EngineParams::sanitize`], so
//! an out-of-range value is silently clamped to its legal range rather than
//! rejected.

use crate::dsp::tinnitus::TinnitusParams;

/// Fixed EQ band centers in Hz.
pub const EQ_FREQUENCIES: [f32; 3] = [250.0, 1000.0, 4000.0];

/// Q shared by the three musical EQ bands.
pub const EQ_Q: f32 = 1.4;

/// High-pass / low-pass toggle with corner frequency.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterParams {
    pub enabled: bool,
    pub frequency: f32,
}

/// 3-band peaking EQ gains in dB.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct EqParams {
    pub low_gain_db: f32,
    pub mid_gain_db: f32,
    pub high_gain_db: f32,
}

/// External noise-suppression helper settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NsParams {
    pub enabled: bool,
    /// 0 = mild, 1 = medium, 2 = aggressive.
    pub mode: u8,
}

/// External AGC helper settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AgcParams {
    pub enabled: bool,
    pub mode: u8,
    pub compression_gain_db: u8,
    pub limiter_enabled: bool,
    pub target_level_dbfs: i8,
}

/// Voice-exclusion cancellation backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VeMode {
    #[default]
    Nlms,
    Aec,
}

/// Voice-exclusion configuration: NLMS tuning, reference conditioning, and
/// the external AEC/VAD alternative.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoiceExclusionParams {
    pub enabled: bool,
    pub mode: VeMode,
    /// 0 = no removal, 1 = full removal.
    pub blend: f32,
    pub step_size: f32,
    pub filter_length: usize,
    /// Per-sample removal bound as a fraction of the signal magnitude.
    pub max_attenuation: f32,
    pub ref_gain: f32,
    pub ref_hpf: f32,
    pub ref_lpf: f32,
    pub aec_mode: u8,
    pub aec_filter_len: u8,
    pub vad_enabled: bool,
    pub vad_mode: u8,
    pub vad_gate_enabled: bool,
    pub vad_gate_attenuation: f32,
}

/// Output stage settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputParams {
    pub gain: f32,
    pub volume: u8,
    /// Muted by default so a fresh engine never surprises the wearer.
    pub mute: bool,
    pub boost_enabled: bool,
}

/// The complete engine configuration record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EngineParams {
    /// Codec PGA units, 0..=240.
    pub mic_gain: f32,
    pub hpf: FilterParams,
    pub lpf: FilterParams,
    pub eq: EqParams,
    pub ns: NsParams,
    pub agc: AgcParams,
    pub voice_exclusion: VoiceExclusionParams,
    pub output: OutputParams,
    pub tinnitus: TinnitusParams,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            mic_gain: 180.0,
            hpf: FilterParams {
                enabled: true,
                frequency: 80.0,
            },
            lpf: FilterParams {
                enabled: false,
                frequency: 18000.0,
            },
            eq: EqParams::default(),
            ns: NsParams {
                enabled: false,
                mode: 1,
            },
            agc: AgcParams {
                enabled: false,
                mode: 0,
                compression_gain_db: 9,
                limiter_enabled: true,
                target_level_dbfs: -3,
            },
            voice_exclusion: VoiceExclusionParams {
                enabled: false,
                mode: VeMode::Nlms,
                blend: 1.0,
                step_size: 0.1,
                filter_length: 128,
                max_attenuation: 0.8,
                ref_gain: 1.0,
                ref_hpf: 100.0,
                ref_lpf: 4000.0,
                aec_mode: 0,
                aec_filter_len: 4,
                vad_enabled: false,
                vad_mode: 2,
                vad_gate_enabled: false,
                vad_gate_attenuation: 0.5,
            },
            output: OutputParams {
                gain: 1.0,
                volume: 80,
                mute: true,
                boost_enabled: false,
            },
            tinnitus: TinnitusParams::default(),
        }
    }
}

impl EngineParams {
    /// Clamp every field to its legal range, in place.
    pub fn sanitize(&mut self) {
        self.mic_gain = self.mic_gain.clamp(0.0, 240.0);

        self.hpf.frequency = self.hpf.frequency.clamp(20.0, 2000.0);
        self.lpf.frequency = self.lpf.frequency.clamp(500.0, 20000.0);

        self.eq.low_gain_db = self.eq.low_gain_db.clamp(-12.0, 12.0);
        self.eq.mid_gain_db = self.eq.mid_gain_db.clamp(-12.0, 12.0);
        self.eq.high_gain_db = self.eq.high_gain_db.clamp(-12.0, 12.0);

        self.ns.mode = self.ns.mode.min(2);

        self.agc.mode = self.agc.mode.min(3);
        self.agc.compression_gain_db = self.agc.compression_gain_db.min(90);
        self.agc.target_level_dbfs = self.agc.target_level_dbfs.clamp(-31, 0);

        let ve = &mut self.voice_exclusion;
        ve.blend = ve.blend.clamp(0.0, 1.0);
        ve.step_size = ve.step_size.clamp(0.01, 1.0);
        ve.filter_length = ve.filter_length.clamp(16, 512);
        ve.max_attenuation = ve.max_attenuation.clamp(0.0, 1.0);
        ve.ref_gain = ve.ref_gain.clamp(0.1, 5.0);
        ve.ref_hpf = ve.ref_hpf.clamp(20.0, 500.0);
        ve.ref_lpf = ve.ref_lpf.clamp(1000.0, 8000.0);
        ve.aec_filter_len = ve.aec_filter_len.clamp(1, 6);
        ve.vad_mode = ve.vad_mode.min(4);
        ve.vad_gate_attenuation = ve.vad_gate_attenuation.clamp(0.0, 1.0);

        self.output.gain = self.output.gain.clamp(0.0, 6.0);
        self.output.volume = self.output.volume.min(100);

        for notch in self.tinnitus.notches.iter_mut() {
            notch.frequency = notch.frequency.clamp(500.0, 12000.0);
            notch.q = notch.q.clamp(1.0, 16.0);
        }
        let masking = &mut self.tinnitus.masking;
        masking.level = masking.level.clamp(0.0, 1.0);
        masking.low_cut = masking.low_cut.clamp(20.0, 12000.0);
        masking.high_cut = masking.high_cut.clamp(200.0, 16000.0).max(masking.low_cut);

        let tone = &mut self.tinnitus.tone;
        tone.frequency = tone.frequency.clamp(100.0, 12000.0);
        tone.level = tone.level.clamp(0.0, 1.0);

        let hf = &mut self.tinnitus.hf_extension;
        hf.frequency = hf.frequency.clamp(1000.0, 16000.0);
        hf.gain_db = hf.gain_db.clamp(0.0, 12.0);

        let binaural = &mut self.tinnitus.binaural;
        binaural.carrier = binaural.carrier.clamp(50.0, 1500.0);
        binaural.beat = binaural.beat.clamp(1.0, 40.0);
        binaural.level = binaural.level.clamp(0.0, 1.0);
    }

    /// Copy of this record with every field clamped.
    pub fn sanitized(mut self) -> Self {
        self.sanitize();
        self
    }
}

/// Read-only level snapshot published by the worker once per block.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Levels {
    pub rms_left: f32,
    pub rms_right: f32,
    pub peak_left: f32,
    pub peak_right: f32,
    /// Conditioned headphone-boom reference channel.
    pub rms_hp: f32,
    pub peak_hp: f32,
    /// Last-known VAD verdict; retains its value while VAD is off.
    pub vad_speech_detected: bool,
}

impl Levels {
    /// Left/right RMS ratio used during mic calibration. Returns 1.0 when
    /// the right channel is effectively silent.
    pub fn balance_ratio(&self) -> f32 {
        if self.rms_right <= 1e-9 {
            1.0
        } else {
            self.rms_left / self.rms_right
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::tinnitus::NoiseType;

    #[test]
    fn test_defaults_are_safe() {
        let params = EngineParams::default();
        assert!(params.output.mute, "engine must default to muted output");
        assert_eq!(params.tinnitus.masking.noise_type, NoiseType::Off);
        // Defaults must already be inside the legal ranges.
        assert_eq!(params, params.sanitized());
    }

    #[test]
    fn test_sanitize_clamps_out_of_range_fields() {
        let mut params = EngineParams::default();
        params.mic_gain = 500.0;
        params.hpf.frequency = 1.0;
        params.lpf.frequency = 96000.0;
        params.eq.mid_gain_db = -40.0;
        params.ns.mode = 9;
        params.agc.mode = 200;
        params.agc.compression_gain_db = 255;
        params.agc.target_level_dbfs = -100;
        params.voice_exclusion.blend = 2.5;
        params.voice_exclusion.step_size = 0.0;
        params.voice_exclusion.filter_length = 4;
        params.voice_exclusion.ref_gain = 50.0;
        params.voice_exclusion.aec_filter_len = 0;
        params.output.gain = 100.0;
        params.output.volume = 255;
        params.tinnitus.notches[2].frequency = 100.0;
        params.tinnitus.notches[2].q = 64.0;
        params.tinnitus.binaural.beat = 500.0;
        params.sanitize();

        assert_eq!(params.mic_gain, 240.0);
        assert_eq!(params.hpf.frequency, 20.0);
        assert_eq!(params.lpf.frequency, 20000.0);
        assert_eq!(params.eq.mid_gain_db, -12.0);
        assert_eq!(params.ns.mode, 2);
        assert_eq!(params.agc.mode, 3);
        assert_eq!(params.agc.compression_gain_db, 90);
        assert_eq!(params.agc.target_level_dbfs, -31);
        assert_eq!(params.voice_exclusion.blend, 1.0);
        assert_eq!(params.voice_exclusion.step_size, 0.01);
        assert_eq!(params.voice_exclusion.filter_length, 16);
        assert_eq!(params.voice_exclusion.ref_gain, 5.0);
        assert_eq!(params.voice_exclusion.aec_filter_len, 1);
        assert_eq!(params.output.gain, 6.0);
        assert_eq!(params.output.volume, 100);
        assert_eq!(params.tinnitus.notches[2].frequency, 500.0);
        assert_eq!(params.tinnitus.notches[2].q, 16.0);
        assert_eq!(params.tinnitus.binaural.beat, 40.0);
    }

    #[test]
    fn test_masking_band_stays_ordered() {
        let mut params = EngineParams::default();
        params.tinnitus.masking.low_cut = 9000.0;
        params.tinnitus.masking.high_cut = 300.0;
        params.sanitize();
        assert!(params.tinnitus.masking.high_cut >= params.tinnitus.masking.low_cut);
    }

    #[test]
    fn test_balance_ratio() {
        let mut levels = Levels::default();
        assert_eq!(levels.balance_ratio(), 1.0);
        levels.rms_left = 0.4;
        levels.rms_right = 0.2;
        assert!((levels.balance_ratio() - 2.0).abs() < 1e-6);
    }
}
