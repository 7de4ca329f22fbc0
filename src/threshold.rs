// src/threshold.rs
//
// Maps a linear control position in [0, 1] onto a threshold spanning four
// orders of magnitude (1e-5 to 1e-1 degrees of arc), and back.
//
// Each quarter of the control covers one decade and interpolates linearly
// inside it:
//
//   [0.00, 0.25) -> [1e-5, 1e-4)
//   [0.25, 0.50) -> [1e-4, 1e-3)
//   [0.50, 0.75) -> [1e-3, 1e-2)
//   [0.75, 1.00] -> [1e-2, 1e-1]

use crate::error::ValidationError;
use crate::geo::degrees_to_meters;

pub const MIN_THRESHOLD_DEGREES: f64 = 1e-5;
pub const MAX_THRESHOLD_DEGREES: f64 = 1e-1;

const SEGMENT_WIDTH: f64 = 0.25;

/// (lower, upper) threshold bound of each control segment
const SEGMENTS: [(f64, f64); 4] = [(1e-5, 1e-4), (1e-4, 1e-3), (1e-3, 1e-2), (1e-2, 1e-1)];

pub fn min_threshold_meters() -> f64 {
    degrees_to_meters(MIN_THRESHOLD_DEGREES)
}

pub fn max_threshold_meters() -> f64 {
    degrees_to_meters(MAX_THRESHOLD_DEGREES)
}

/// Forward mapping. Positions outside [0, 1] are clamped, NaN maps to the
/// minimum.
pub fn control_to_threshold(position: f64) -> f64 {
    if position.is_nan() || position <= 0.0 {
        return MIN_THRESHOLD_DEGREES;
    }
    if position >= 1.0 {
        return MAX_THRESHOLD_DEGREES;
    }

    let index = ((position / SEGMENT_WIDTH).floor() as usize).min(SEGMENTS.len() - 1);
    let (lower, upper) = SEGMENTS[index];
    let segment_start = index as f64 * SEGMENT_WIDTH;

    lower + (position - segment_start) / SEGMENT_WIDTH * (upper - lower)
}

/// Inverse mapping. Segments are closed on the lower bound and open on the
/// upper one, except the last which is closed on both.
pub fn threshold_to_control(threshold: f64) -> Result<f64, ValidationError> {
    let threshold = validate_degrees(threshold)?;
    if threshold == MAX_THRESHOLD_DEGREES {
        return Ok(1.0);
    }

    let index = SEGMENTS
        .iter()
        .position(|&(lower, upper)| threshold >= lower && threshold < upper)
        .unwrap_or(SEGMENTS.len() - 1);
    let (lower, upper) = SEGMENTS[index];

    Ok(index as f64 * SEGMENT_WIDTH + (threshold - lower) / (upper - lower) * SEGMENT_WIDTH)
}

pub fn validate_degrees(threshold: f64) -> Result<f64, ValidationError> {
    if threshold.is_finite() && (MIN_THRESHOLD_DEGREES..=MAX_THRESHOLD_DEGREES).contains(&threshold)
    {
        Ok(threshold)
    } else {
        Err(ValidationError::OutOfRange {
            value: threshold,
            min: MIN_THRESHOLD_DEGREES,
            max: MAX_THRESHOLD_DEGREES,
        })
    }
}

pub fn validate_meters(meters: f64) -> Result<f64, ValidationError> {
    let (min, max) = (min_threshold_meters(), max_threshold_meters());
    if meters.is_finite() && (min..=max).contains(&meters) {
        Ok(meters)
    } else {
        Err(ValidationError::OutOfRange {
            value: meters,
            min,
            max,
        })
    }
}

/// Parse a threshold typed by the user, in degrees
pub fn parse_threshold_input(text: &str) -> Result<f64, ValidationError> {
    let value = text
        .trim()
        .parse::<f64>()
        .map_err(|_| ValidationError::NotANumber(text.to_string()))?;
    validate_degrees(value)
}

/// State behind a threshold text field paired with a linear control
///
/// Holds the last accepted value. Rejected input never replaces it, so the
/// field can always be redrawn from `value()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdControl {
    accepted: f64,
}

impl ThresholdControl {
    pub fn new(initial_degrees: f64) -> Result<Self, ValidationError> {
        Ok(Self {
            accepted: validate_degrees(initial_degrees)?,
        })
    }

    pub fn value(&self) -> f64 {
        self.accepted
    }

    pub fn control_position(&self) -> f64 {
        threshold_to_control(self.accepted).unwrap_or(0.0)
    }

    /// Text the field shows for the accepted value
    pub fn text(&self) -> String {
        self.accepted.to_string()
    }

    /// Move the linear control; always accepted
    pub fn set_control_position(&mut self, position: f64) -> f64 {
        self.accepted = control_to_threshold(position);
        self.accepted
    }

    /// Apply typed input. On rejection the previous value stays in place
    /// and the error says why.
    pub fn apply_text(&mut self, text: &str) -> Result<f64, ValidationError> {
        let value = parse_threshold_input(text)?;
        self.accepted = value;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_positions_are_exact() {
        assert_eq!(control_to_threshold(0.0), 1e-5);
        assert_eq!(control_to_threshold(0.25), 1e-4);
        assert_eq!(control_to_threshold(0.5), 1e-3);
        assert_eq!(control_to_threshold(0.75), 1e-2);
        assert_eq!(control_to_threshold(1.0), 1e-1);
    }

    #[test]
    fn positions_outside_range_are_clamped() {
        assert_eq!(control_to_threshold(-0.5), MIN_THRESHOLD_DEGREES);
        assert_eq!(control_to_threshold(1.5), MAX_THRESHOLD_DEGREES);
        assert_eq!(control_to_threshold(f64::NAN), MIN_THRESHOLD_DEGREES);
    }

    #[test]
    fn interpolates_linearly_within_a_segment() {
        // Halfway through the second segment
        let t = control_to_threshold(0.375);
        assert!((t - 5.5e-4).abs() < 1e-15, "got {}", t);
    }

    #[test]
    fn inverse_of_forward_is_identity() {
        for i in 0..=1000 {
            let s = i as f64 / 1000.0;
            let back = threshold_to_control(control_to_threshold(s)).unwrap();
            assert!((back - s).abs() < 1e-9, "s={} came back as {}", s, back);
        }
    }

    #[test]
    fn forward_of_inverse_is_identity() {
        let thresholds = [1e-5, 2.5e-5, 9.99e-5, 1e-4, 4e-4, 1e-3, 7.7e-3, 1e-2, 0.05, 1e-1];
        for t in thresholds {
            let s = threshold_to_control(t).unwrap();
            let back = control_to_threshold(s);
            assert!((back - t).abs() <= t * 1e-9, "t={} came back as {}", t, back);
        }
    }

    #[test]
    fn inverse_picks_upper_segment_at_shared_bounds() {
        assert_eq!(threshold_to_control(1e-4).unwrap(), 0.25);
        assert_eq!(threshold_to_control(1e-3).unwrap(), 0.5);
        assert_eq!(threshold_to_control(1e-1).unwrap(), 1.0);
    }

    #[test]
    fn inverse_rejects_out_of_range() {
        assert!(threshold_to_control(9e-6).is_err());
        assert!(threshold_to_control(0.2).is_err());
        assert!(threshold_to_control(f64::INFINITY).is_err());
    }

    #[test]
    fn text_input_validation() {
        assert_eq!(parse_threshold_input(" 0.001 "), Ok(0.001));
        assert_eq!(parse_threshold_input("1e-5"), Ok(1e-5));
        assert!(matches!(
            parse_threshold_input("abc"),
            Err(ValidationError::NotANumber(_))
        ));
        assert!(matches!(
            parse_threshold_input("0.5"),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(matches!(
            parse_threshold_input("NaN"),
            Err(ValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn control_reverts_on_rejected_text() {
        let mut control = ThresholdControl::new(1e-3).unwrap();

        assert!(control.apply_text("abc").is_err());
        assert_eq!(control.value(), 1e-3);
        assert_eq!(control.text(), "0.001");

        assert!(control.apply_text("0.9").is_err());
        assert_eq!(control.value(), 1e-3);

        assert_eq!(control.apply_text("0.02"), Ok(0.02));
        assert_eq!(control.value(), 0.02);
    }

    #[test]
    fn control_position_follows_slider() {
        let mut control = ThresholdControl::new(1e-5).unwrap();
        assert_eq!(control.set_control_position(0.25), 1e-4);
        assert_eq!(control.control_position(), 0.25);
    }

    #[test]
    fn meter_bounds_span_the_degree_range() {
        assert!((min_threshold_meters() - 1.112).abs() < 0.001);
        assert!((max_threshold_meters() - 11_119.49).abs() < 0.01);
        assert!(validate_meters(50.0).is_ok());
        assert!(validate_meters(1.0).is_err());
    }
}
