use half::f16;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// The arithmetic mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Full,
    /// Half precision compute with a dynamic loss scale guarding the gradients.
    #[default]
    Mixed,
}

impl Precision {
    pub fn is_mixed(&self) -> bool {
        matches!(self, Precision::Mixed)
    }
}

/// Rounds a value through IEEE binary16 and back. Values beyond its range become infinite
/// just like a half precision kernel would produce.
#[inline]
pub fn to_half_precision(v: f32) -> f32 {
    f16::from_f32(v).to_f32()
}

/// Applies [`to_half_precision`] to every value.
pub fn round_to_half(values: &mut [f32]) {
    values.par_iter_mut().for_each(|v| *v = to_half_precision(*v));
}

/// Returns true if every value is finite.
pub fn all_finite(values: &[f32]) -> bool {
    values.par_iter().all(|v| v.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: u32,
    pub min_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(16),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
        }
    }
}

/// Dynamic loss scaling for mixed precision training.
///
/// The loss gradient is multiplied by `scale` before the backward pass so small gradients
/// survive half precision, and divided back before the optimizer step. A step whose
/// gradients overflowed is skipped and the scale backs off; after `growth_interval` clean
/// steps in a row the scale grows again.
#[derive(Debug, Clone)]
pub struct GradScaler {
    config: LossScaleConfig,
    scale: f32,
    stable_steps: u32,
}

impl GradScaler {
    pub fn new(config: LossScaleConfig) -> Self {
        let config = sanitize_config(config);

        Self {
            scale: config.initial_scale,
            stable_steps: 0,
            config,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn stable_steps(&self) -> u32 {
        self.stable_steps
    }

    /// Divides `grad` by the current scale.
    ///
    /// # Returns
    /// `true` if any value is not finite, in which case the step must be skipped.
    pub fn unscale(&self, grad: &mut [f32]) -> bool {
        let inv = 1. / self.scale;
        grad.par_iter_mut().for_each(|g| *g *= inv);
        !all_finite(grad)
    }

    /// Adjusts the scale after a step.
    ///
    /// # Arguments
    /// * `found_inf` - Whether the step's gradients overflowed.
    pub fn update(&mut self, found_inf: bool) {
        let LossScaleConfig {
            growth_factor,
            backoff_factor,
            growth_interval,
            min_scale,
            ..
        } = self.config;

        if found_inf {
            self.scale = (self.scale * backoff_factor).max(min_scale);
            self.stable_steps = 0;
            return;
        }

        self.stable_steps += 1;
        if self.stable_steps >= growth_interval {
            let grown = self.scale * growth_factor;
            if grown.is_finite() {
                self.scale = grown;
            }
            self.stable_steps = 0;
        }
    }

    /// Restores a scale and counter saved from a previous run.
    pub fn restore(&mut self, scale: f32, stable_steps: u32) {
        if scale.is_finite() && scale >= self.config.min_scale {
            self.scale = scale;
            self.stable_steps = stable_steps;
        } else {
            log::warn!(scale = scale; "ignoring invalid stored loss scale");
        }
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(LossScaleConfig::default())
    }
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    config.initial_scale = config.initial_scale.max(config.min_scale);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_after_interval() {
        let mut scaler = GradScaler::new(LossScaleConfig {
            initial_scale: 512.0,
            growth_interval: 2,
            ..Default::default()
        });

        scaler.update(false);
        assert_eq!(scaler.scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 1024.0);
        assert_eq!(scaler.stable_steps(), 0);
    }

    #[test]
    fn backs_off_to_the_floor() {
        let mut scaler = GradScaler::new(LossScaleConfig {
            initial_scale: 4.0,
            ..Default::default()
        });

        for expected in [2.0, 1.0, 1.0] {
            scaler.update(true);
            assert_eq!(scaler.scale(), expected);
        }
    }

    #[test]
    fn default_matches_the_usual_amp_settings() {
        let scaler = GradScaler::default();
        assert_eq!(scaler.scale(), 65536.0);
    }

    #[test]
    fn unscale_reports_overflow() {
        let scaler = GradScaler::default();

        let mut finite = vec![65536., -131072.];
        assert!(!scaler.unscale(&mut finite));
        assert_eq!(finite, [1., -2.]);

        let mut overflow = vec![1., f32::INFINITY];
        assert!(scaler.unscale(&mut overflow));

        let mut nan = vec![f32::NAN];
        assert!(scaler.unscale(&mut nan));
    }

    #[test]
    fn half_rounding_saturates_to_infinity() {
        let mut values = vec![1.0, 0.1, 70000.0];
        round_to_half(&mut values);

        assert_eq!(values[0], 1.0);
        assert!((values[1] - 0.1).abs() < 1e-3 && values[1] != 0.1);
        assert!(values[2].is_infinite());
    }
}
