//! Accelerometer Signal Processor
//!
//! Conditions raw ring accelerometer samples for pointer control:
//! calibration offset, exponential smoothing, rotation correction and
//! deadzone/sensitivity mapping.

use crate::domain::models::{PointerDelta, ProcessedSample, RawAccelSample};
use crate::domain::settings::TuningConfig;

/// Lower bound on the EWMA gain; keeps a smoothing of 1.0 from freezing the filter
pub const MIN_SMOOTHING_ALPHA: f64 = 0.01;

/// Signal pipeline for air-mouse style control
#[derive(Debug, Default)]
pub struct SignalProcessor {
    // Calibration offset (resting orientation)
    offset_x: f64,
    offset_y: f64,
    offset_z: f64,

    // EWMA accumulators, X and Y only
    smoothed_x: f64,
    smoothed_y: f64,

    last_raw: Option<RawAccelSample>,
}

impl SignalProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the latest raw sample as the new zero point
    ///
    /// Returns the offset now in effect. Smoothing state is cleared so the next
    /// sample is not dragged toward the old baseline.
    pub fn calibrate(&mut self) -> RawAccelSample {
        let reference = self.last_raw.unwrap_or_default();
        self.offset_x = reference.x as f64;
        self.offset_y = reference.y as f64;
        self.offset_z = reference.z as f64;
        self.smoothed_x = 0.0;
        self.smoothed_y = 0.0;

        tracing::info!(
            "Calibration offset set to ({}, {}, {})",
            reference.x,
            reference.y,
            reference.z
        );
        reference
    }

    pub fn offset(&self) -> (f64, f64, f64) {
        (self.offset_x, self.offset_y, self.offset_z)
    }

    /// Run one sample through calibration, smoothing and rotation
    pub fn process(&mut self, raw: RawAccelSample, tuning: &TuningConfig) -> ProcessedSample {
        self.last_raw = Some(raw);

        let corrected_x = raw.x as f64 - self.offset_x;
        let corrected_y = raw.y as f64 - self.offset_y;
        let corrected_z = raw.z as f64 - self.offset_z;

        let alpha = smoothing_alpha(tuning.smoothing);
        self.smoothed_x = ewma(self.smoothed_x, corrected_x, alpha);
        self.smoothed_y = ewma(self.smoothed_y, corrected_y, alpha);

        let (x, y) = rotate(self.smoothed_x, self.smoothed_y, tuning.rotation_deg);

        ProcessedSample {
            x,
            y,
            z: corrected_z,
        }
    }
}

/// EWMA gain for a smoothing setting in [0, 1]
///
/// Out-of-range settings are clamped, so the gain stays in
/// [`MIN_SMOOTHING_ALPHA`, 1].
pub fn smoothing_alpha(smoothing: f64) -> f64 {
    if !smoothing.is_finite() {
        return 1.0;
    }
    (1.0 - smoothing.clamp(0.0, 1.0)).max(MIN_SMOOTHING_ALPHA)
}

/// One exponential smoothing step
pub fn ewma(previous: f64, sample: f64, alpha: f64) -> f64 {
    alpha * sample + (1.0 - alpha) * previous
}

/// Rotate (x, y) counter-clockwise by `degrees`
pub fn rotate(x: f64, y: f64, degrees: f64) -> (f64, f64) {
    if degrees.abs() < f64::EPSILON {
        return (x, y);
    }
    let (sin, cos) = degrees.to_radians().sin_cos();
    (x * cos - y * sin, x * sin + y * cos)
}

/// Map a processed sample to a cursor delta
///
/// Samples inside the circular deadzone produce a zero delta; anything on or
/// beyond the radius scales linearly with sensitivity, rounded to whole pixels.
pub fn pointer_delta(sample: &ProcessedSample, tuning: &TuningConfig) -> PointerDelta {
    let magnitude = (sample.x * sample.x + sample.y * sample.y).sqrt();
    if magnitude < tuning.deadzone as f64 {
        return PointerDelta::default();
    }

    PointerDelta {
        dx: (sample.x * tuning.sensitivity).round() as i32,
        dy: (sample.y * tuning.sensitivity).round() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-9;

    fn no_smoothing() -> TuningConfig {
        TuningConfig {
            smoothing: 0.0,
            ..Default::default()
        }
    }

    fn raw(x: i16, y: i16, z: i16) -> RawAccelSample {
        RawAccelSample { x, y, z }
    }

    #[test]
    fn test_alpha_floor() {
        assert_eq!(smoothing_alpha(1.0), MIN_SMOOTHING_ALPHA);
        assert!((smoothing_alpha(0.5) - 0.5).abs() < TOLERANCE);
        assert_eq!(smoothing_alpha(0.0), 1.0);
    }

    #[test]
    fn test_out_of_range_smoothing_keeps_ewma_bounded() {
        assert_eq!(smoothing_alpha(-1.0), 1.0);
        assert_eq!(smoothing_alpha(2.5), MIN_SMOOTHING_ALPHA);
        assert_eq!(smoothing_alpha(f64::NAN), 1.0);

        let mut processor = SignalProcessor::new();
        let tuning = TuningConfig {
            smoothing: -1.0,
            ..Default::default()
        };
        let first = processor.process(raw(100, 0, 0), &tuning);
        let second = processor.process(raw(100, 0, 0), &tuning);
        assert!((first.x - 100.0).abs() < TOLERANCE, "first={}", first.x);
        assert!((second.x - 100.0).abs() < TOLERANCE, "second={}", second.x);
    }

    #[test]
    fn test_ewma_step_is_bounded() {
        let cases = [(0.0, 100.0), (100.0, -50.0), (-3.5, -3.5), (2047.0, -2048.0)];
        for alpha in [MIN_SMOOTHING_ALPHA, 0.1, 0.5, 0.9, 1.0] {
            for (prev, sample) in cases {
                let out = ewma(prev, sample, alpha);
                let lo = prev.min(sample);
                let hi = prev.max(sample);
                assert!(
                    out >= lo - TOLERANCE && out <= hi + TOLERANCE,
                    "alpha={alpha} prev={prev} sample={sample} out={out}"
                );
            }
        }
    }

    #[test]
    fn test_rotation_zero_is_identity() {
        assert_eq!(rotate(12.5, -7.0, 0.0), (12.5, -7.0));
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let (x, y) = (300.0_f64, -400.0_f64);
        for degrees in [1.0, 45.0, 90.0, 137.5, 180.0, -60.0, 359.0] {
            let (rx, ry) = rotate(x, y, degrees);
            let before = (x * x + y * y).sqrt();
            let after = (rx * rx + ry * ry).sqrt();
            assert!((before - after).abs() < 1e-6, "angle {degrees}");
        }
    }

    #[test]
    fn test_rotation_quarter_turn() {
        let (x, y) = rotate(1.0, 0.0, 90.0);
        assert!(x.abs() < TOLERANCE);
        assert!((y - 1.0).abs() < TOLERANCE);
    }

    #[test]
    fn test_deadzone_boundary() {
        let tuning = TuningConfig {
            deadzone: 200,
            sensitivity: 0.1,
            ..Default::default()
        };

        let inside = ProcessedSample {
            x: 199.9,
            y: 0.0,
            z: 0.0,
        };
        assert!(pointer_delta(&inside, &tuning).is_zero());

        // 120-160-200 triangle: magnitude exactly on the radius moves
        let on_edge = ProcessedSample {
            x: 120.0,
            y: 160.0,
            z: 0.0,
        };
        assert_eq!(
            pointer_delta(&on_edge, &tuning),
            PointerDelta { dx: 12, dy: 16 }
        );
    }

    #[test]
    fn test_sensitivity_is_linear() {
        let sample = ProcessedSample {
            x: 1000.0,
            y: -600.0,
            z: 0.0,
        };
        let mut tuning = TuningConfig {
            deadzone: 0,
            sensitivity: 0.01,
            ..Default::default()
        };
        let single = pointer_delta(&sample, &tuning);
        tuning.sensitivity = 0.02;
        let double = pointer_delta(&sample, &tuning);

        assert_eq!(single, PointerDelta { dx: 10, dy: -6 });
        assert_eq!(double, PointerDelta { dx: 20, dy: -12 });
    }

    #[test]
    fn test_small_delta_rounds_to_zero() {
        let tuning = TuningConfig {
            deadzone: 0,
            sensitivity: 0.001,
            ..Default::default()
        };
        let sample = ProcessedSample {
            x: 300.0,
            y: 300.0,
            z: 0.0,
        };
        assert!(pointer_delta(&sample, &tuning).is_zero());
    }

    #[test]
    fn test_process_applies_offset_and_passes_z() {
        let mut processor = SignalProcessor::new();
        let tuning = no_smoothing();

        processor.process(raw(100, -50, 1000), &tuning);
        processor.calibrate();

        let out = processor.process(raw(150, -50, 900), &tuning);
        assert!((out.x - 50.0).abs() < TOLERANCE);
        assert!(out.y.abs() < TOLERANCE);
        assert!((out.z + 100.0).abs() < TOLERANCE);
    }

    #[test]
    fn test_z_is_not_smoothed() {
        let mut processor = SignalProcessor::new();
        let tuning = TuningConfig {
            smoothing: 0.9,
            ..Default::default()
        };

        let out = processor.process(raw(1000, 1000, 1000), &tuning);
        assert!((out.x - 100.0).abs() < 1e-6);
        assert!((out.y - 100.0).abs() < 1e-6);
        assert_eq!(out.z, 1000.0);
    }

    #[test]
    fn test_calibration_resets_smoothing() {
        let mut processor = SignalProcessor::new();
        let tuning = TuningConfig {
            smoothing: 0.5,
            ..Default::default()
        };

        processor.process(raw(800, 800, 0), &tuning);
        processor.process(raw(800, 800, 0), &tuning);
        let offset = processor.calibrate();
        assert_eq!(offset, raw(800, 800, 0));

        // Same sample as the offset: corrected is zero and so is the history
        let out = processor.process(raw(800, 800, 0), &tuning);
        assert!(out.x.abs() < TOLERANCE);
        assert!(out.y.abs() < TOLERANCE);
    }

    #[test]
    fn test_calibrate_without_samples_keeps_zero_offset() {
        let mut processor = SignalProcessor::new();
        assert_eq!(processor.calibrate(), RawAccelSample::default());
        assert_eq!(processor.offset(), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_rotation_applied_after_smoothing() {
        let mut processor = SignalProcessor::new();
        let tuning = TuningConfig {
            smoothing: 0.0,
            rotation_deg: 180.0,
            ..Default::default()
        };
        let out = processor.process(raw(10, 20, 5), &tuning);
        assert!((out.x + 10.0).abs() < 1e-9);
        assert!((out.y + 20.0).abs() < 1e-9);
        assert_eq!(out.z, 5.0);
    }
}
