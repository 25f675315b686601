// Closed-form interpolation shapes. Each maps progress p ∈ [0, 1] to an
// eased fraction of the travel, exact at both endpoints. Over and Under
// overshoot by a fixed 10 % and settle back.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    Linear,
    Logarithmic,
    Exponential,
    Sine,
    Over,
    Under,
}

/// Fraction of the Over/Under travel spent reaching the overshoot peak.
const OVER_RISE: f32 = 0.75;
const OVERSHOOT: f32 = 0.1;

impl Shape {
    pub fn from_name(name: &str) -> Option<Shape> {
        match name {
            "linear" => Some(Shape::Linear),
            "logarithmic" | "log" => Some(Shape::Logarithmic),
            "exponential" | "expo" | "exp" => Some(Shape::Exponential),
            "sine" => Some(Shape::Sine),
            "over" => Some(Shape::Over),
            "under" => Some(Shape::Under),
            _ => None,
        }
    }

    /// Eased fraction at progress `p` (clamped to [0, 1]).
    pub fn apply(self, p: f32) -> f32 {
        let p = p.clamp(0.0, 1.0);
        match self {
            Shape::Linear => p,
            // Base-2 mappings, exact at both endpoints.
            Shape::Logarithmic => (1.0 + p).log2(),
            Shape::Exponential => p.exp2() - 1.0,
            // Half-period raised cosine.
            Shape::Sine => 0.5 * (1.0 - (std::f32::consts::PI * p).cos()),
            Shape::Over => over(p),
            // Mirror of Over: dips 10 % below the start, then rises.
            Shape::Under => 1.0 - over(1.0 - p),
        }
    }
}

fn over(p: f32) -> f32 {
    let peak = 1.0 + OVERSHOOT;
    if p < OVER_RISE {
        // Ease-out rise to the overshoot peak.
        peak * (std::f32::consts::FRAC_PI_2 * p / OVER_RISE).sin()
    } else {
        // Smooth settle from the peak back to the destination.
        let q = (p - OVER_RISE) / (1.0 - OVER_RISE);
        peak - OVERSHOOT * 0.5 * (1.0 - (std::f32::consts::PI * q).cos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Shape; 6] = [
        Shape::Linear,
        Shape::Logarithmic,
        Shape::Exponential,
        Shape::Sine,
        Shape::Over,
        Shape::Under,
    ];

    #[test]
    fn endpoints_are_exact() {
        for shape in ALL {
            assert!(shape.apply(0.0).abs() < 1e-6, "{shape:?} at 0");
            assert!((shape.apply(1.0) - 1.0).abs() < 1e-6, "{shape:?} at 1");
        }
    }

    #[test]
    fn over_peaks_ten_percent_high() {
        let peak = (0..=100)
            .map(|i| Shape::Over.apply(i as f32 / 100.0))
            .fold(f32::MIN, f32::max);
        assert!((peak - 1.1).abs() < 1e-3, "peak {peak}");
    }

    #[test]
    fn under_dips_ten_percent_low() {
        let trough = (0..=100)
            .map(|i| Shape::Under.apply(i as f32 / 100.0))
            .fold(f32::MAX, f32::min);
        assert!((trough + 0.1).abs() < 1e-3, "trough {trough}");
    }

    #[test]
    fn monotone_shapes_are_monotone() {
        for shape in [Shape::Linear, Shape::Logarithmic, Shape::Exponential, Shape::Sine] {
            let mut prev = shape.apply(0.0);
            for i in 1..=64 {
                let v = shape.apply(i as f32 / 64.0);
                assert!(v >= prev - 1e-6, "{shape:?} not monotone at {i}");
                prev = v;
            }
        }
    }

    #[test]
    fn names_round_trip() {
        assert_eq!(Shape::from_name("linear"), Some(Shape::Linear));
        assert_eq!(Shape::from_name("log"), Some(Shape::Logarithmic));
        assert_eq!(Shape::from_name("expo"), Some(Shape::Exponential));
        assert_eq!(Shape::from_name("nope"), None);
    }
}
