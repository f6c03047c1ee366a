//! Normalized-LMS adaptive filter used by the voice-exclusion path.
//!
//! The filter returns its echo/voice estimate instead of the cancelled
//! signal: the caller owns the blend and attenuation policy on the
//! subtraction. The weight update always uses the true, unclamped error;
//! clamping the update term would rob the filter of the gradient it needs
//! to converge.

/// Regularization floor for the normalized step.
const POWER_EPSILON: f32 = 1e-6;

/// Any weight whose magnitude passes this bound is reset to zero in place
/// (divergence guard).
const WEIGHT_LIMIT: f32 = 10.0;

/// NLMS filter with an index-addressed circular reference buffer.
#[derive(Clone, Debug)]
pub struct NlmsFilter {
    weights: Vec<f32>,
    reference: Vec<f32>,
    pos: usize,
}

impl NlmsFilter {
    /// Create a zero-initialized filter with `length` taps.
    pub fn new(length: usize) -> Self {
        debug_assert!(length > 0);
        Self {
            weights: vec![0.0; length],
            reference: vec![0.0; length],
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Zero weights, reference history, and write position.
    pub fn reset(&mut self) {
        self.weights.fill(0.0);
        self.reference.fill(0.0);
        self.pos = 0;
    }

    /// Feed one reference/primary sample pair and return the current voice
    /// estimate. `step` is the unnormalized adaptation step size.
    pub fn process(&mut self, reference: f32, primary: f32, step: f32) -> f32 {
        let len = self.weights.len();
        self.reference[self.pos] = reference;

        let mut estimate = 0.0f32;
        let mut power = 0.0f32;
        for i in 0..len {
            let idx = (self.pos + len - i) % len;
            let r = self.reference[idx];
            estimate += self.weights[i] * r;
            power += r * r;
        }

        // True error: never clamped here.
        let error = primary - estimate;
        let norm_step = step / (power + POWER_EPSILON);

        for i in 0..len {
            let idx = (self.pos + len - i) % len;
            self.weights[i] += norm_step * error * self.reference[idx];
            if self.weights[i].abs() > WEIGHT_LIMIT {
                self.weights[i] = 0.0;
            }
        }

        self.pos = (self.pos + 1) % len;
        estimate
    }

    /// Largest weight magnitude, for diagnostics and tests.
    pub fn max_weight(&self) -> f32 {
        self.weights.iter().fold(0.0f32, |m, w| m.max(w.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_converges_on_delayed_reference() {
        // Primary is the reference delayed by 5 samples; one second of
        // 16 kHz audio must be enough to converge.
        let mut rng = StdRng::seed_from_u64(7);
        let mut filter = NlmsFilter::new(64);
        let mut delay = [0.0f32; 5];

        let mut in_energy = 0.0f64;
        let mut out_energy = 0.0f64;
        for n in 0..16000 {
            let reference: f32 = rng.gen_range(-0.5..0.5);
            let primary = delay[0];
            delay.copy_within(1.., 0);
            delay[4] = reference;

            let estimate = filter.process(reference, primary, 0.1);
            let residual = primary - estimate;
            if n >= 15000 {
                in_energy += (primary as f64).powi(2);
                out_energy += (residual as f64).powi(2);
            }
        }
        let ratio = (out_energy / in_energy.max(1e-12)).sqrt();
        assert!(ratio < 0.02, "residual ratio after convergence: {ratio}");
    }

    #[test]
    fn test_caller_attenuation_policy_bounds_removal() {
        // With the removal clamped to 80% of the signal, the residual floor
        // is exactly 20% of the input even at perfect convergence.
        let mut rng = StdRng::seed_from_u64(11);
        let mut filter = NlmsFilter::new(64);
        let mut delay = [0.0f32; 5];

        let mut in_energy = 0.0f64;
        let mut out_energy = 0.0f64;
        for n in 0..16000 {
            let reference: f32 = rng.gen_range(-0.5..0.5);
            let primary = delay[0];
            delay.copy_within(1.., 0);
            delay[4] = reference;

            let estimate = filter.process(reference, primary, 0.1);
            let bound = primary.abs() * 0.8;
            let removal = estimate.clamp(-bound, bound);
            let residual = primary - removal;
            if n >= 15000 {
                in_energy += (primary as f64).powi(2);
                out_energy += (residual as f64).powi(2);
            }
        }
        let ratio = (out_energy / in_energy.max(1e-12)).sqrt();
        assert!(ratio <= 0.21, "clamped residual ratio: {ratio}");
    }

    #[test]
    fn test_weights_stay_bounded_under_hostile_input() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut filter = NlmsFilter::new(32);
        for _ in 0..10000 {
            // Tiny reference power with a large uncorrelated primary pushes
            // the normalized step hard.
            let reference: f32 = rng.gen_range(-1e-3..1e-3);
            let primary: f32 = rng.gen_range(-1.0..1.0);
            filter.process(reference, primary, 1.0);
            assert!(filter.max_weight() <= WEIGHT_LIMIT);
        }
    }

    #[test]
    fn test_reset_zeroes_state() {
        let mut filter = NlmsFilter::new(16);
        for i in 0..100 {
            filter.process((i as f32 * 0.37).sin(), (i as f32 * 0.21).sin(), 0.5);
        }
        assert!(filter.max_weight() > 0.0);
        filter.reset();
        assert_eq!(filter.max_weight(), 0.0);
        // First estimate after reset is zero: empty weights, empty history.
        assert_eq!(filter.process(0.5, 0.5, 0.1), 0.0);
    }

    #[test]
    fn test_zero_reference_returns_zero_estimate() {
        let mut filter = NlmsFilter::new(16);
        for _ in 0..50 {
            assert_eq!(filter.process(0.0, 0.3, 0.1), 0.0);
        }
    }
}
