//! Gain stage: control value to linear multiplier and decibel text

/// Highest control value (maximum boost)
pub const CONTROL_MAX: f32 = 250.0;

/// Control value giving unity gain
pub const CONTROL_UNITY: f32 = 100.0;

/// Linear gain at `CONTROL_MAX` (~ +15.6 dB)
const MAX_GAIN: f32 = 6.0;

/// Text shown when the multiplier is zero
const MUTE_DB_TEXT: &str = "-inf dB";

/// Map a control value in `[0, 250]` to a linear multiplier.
///
/// Three zones: 0 mutes, `[0, 100]` rises linearly to unity, `[100, 250]`
/// rises linearly to 6x. Callers clamp before calling.
pub fn gain_for_control(control: f32) -> f32 {
    if control <= 0.0 {
        0.0
    } else if control <= CONTROL_UNITY {
        control / CONTROL_UNITY
    } else {
        1.0 + (control - CONTROL_UNITY) / (CONTROL_MAX - CONTROL_UNITY) * (MAX_GAIN - 1.0)
    }
}

/// Decibel text for a linear multiplier, e.g. `"+6.0 dB"`.
pub fn db_text(multiplier: f32) -> String {
    if multiplier > 0.0 {
        format!("{:+.1} dB", 20.0 * multiplier.log10())
    } else {
        MUTE_DB_TEXT.to_string()
    }
}

/// Zero-padded control readout, e.g. `"007"`.
pub fn control_text(control: f32) -> String {
    format!("{:03}", control.round() as u32)
}

/// Multiplier and its decibel text for a control value.
pub fn gain(control: f32) -> (f32, String) {
    let multiplier = gain_for_control(control);
    (multiplier, db_text(multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f32, expected: f32, tolerance: f32) {
        assert!(
            (actual - expected).abs() <= tolerance,
            "expected {expected} +/- {tolerance}, got {actual}"
        );
    }

    #[test]
    fn anchor_points() {
        assert_eq!(gain_for_control(0.0), 0.0);
        assert_approx(gain_for_control(100.0), 1.0, 1e-6);
        assert_approx(gain_for_control(250.0), 6.0, 1e-6);
        assert_approx(gain_for_control(50.0), 0.5, 1e-6);
        assert_approx(gain_for_control(175.0), 3.5, 1e-6);
    }

    #[test]
    fn gain_is_monotonic_over_control_range() {
        let mut previous = gain_for_control(0.0);
        for step in 1..=2500 {
            let current = gain_for_control(step as f32 / 10.0);
            assert!(current >= previous, "gain fell at control {}", step as f32 / 10.0);
            previous = current;
        }
    }

    #[test]
    fn db_text_formats_boost_and_cut() {
        assert_eq!(db_text(1.0), "+0.0 dB");
        assert_eq!(db_text(6.0), "+15.6 dB");
        assert_eq!(db_text(0.5), "-6.0 dB");
    }

    #[test]
    fn db_text_for_mute_is_negative_infinity() {
        let (multiplier, text) = gain(0.0);
        assert_eq!(multiplier, 0.0);
        assert_eq!(text, "-inf dB");
    }

    #[test]
    fn control_text_is_zero_padded() {
        assert_eq!(control_text(7.0), "007");
        assert_eq!(control_text(100.0), "100");
        assert_eq!(control_text(249.6), "250");
    }
}
