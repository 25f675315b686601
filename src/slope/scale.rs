// Output scale quantization: snap a post-shaper voltage to the nearest
// degree of an octave-periodic division table, then clamp to the hardware
// range. The table is pre-converted to volts once, when the scale is set.

/// Hardware output range.
pub const VOLT_CLAMP: f32 = 6.0;

pub const MAX_DEGREES: usize = 16;

#[derive(Clone, Copy, Debug)]
pub struct ScaleMap {
    /// Degree offsets within one period, in volts, ascending.
    divisions: [f32; MAX_DEGREES],
    count: usize,
    /// Period height in volts (1.0 = volts-per-octave).
    scaling: f32,
}

impl ScaleMap {
    /// Build a scale from degrees expressed in `modulo` steps per period
    /// (e.g. `&[0.0, 2.0, 4.0, 5.0, 7.0, 9.0, 11.0]`, modulo 12, scaling
    /// 1.0 for a major scale in 12-TET). An empty degree list yields the
    /// chromatic 12-step table. Script-supplied degrees that do not
    /// convert to a finite voltage (NaN, or any degree over a zero
    /// modulo) are dropped.
    pub fn from_degrees(degrees: &[f32], modulo: f32, scaling: f32) -> ScaleMap {
        let mut divisions = [0.0f32; MAX_DEGREES];
        let mut count = 0;
        if degrees.is_empty() {
            count = 12;
            for (i, d) in divisions.iter_mut().enumerate().take(count) {
                *d = i as f32 / 12.0 * scaling;
            }
        } else {
            for &degree in degrees {
                if count == MAX_DEGREES {
                    break;
                }
                let v = degree / modulo * scaling;
                if !v.is_finite() {
                    continue;
                }
                divisions[count] = v;
                count += 1;
            }
            divisions[..count].sort_by(|a, b| a.total_cmp(b));
        }
        ScaleMap {
            divisions,
            count,
            scaling,
        }
    }

    pub fn scaling(&self) -> f32 {
        self.scaling
    }

    /// Snap `v` to the nearest degree. Candidates include the first degree
    /// of the next period and the last of the previous one, so values near
    /// a period boundary land in the right octave. Ties break to the lower
    /// degree.
    pub fn quantize(&self, v: f32) -> f32 {
        if self.count == 0 || self.scaling == 0.0 {
            return clamp_volts(v);
        }
        let octave = (v / self.scaling).floor();
        let residue = v - octave * self.scaling;

        let mut best = self.divisions[0];
        let mut best_dist = (residue - best).abs();
        let mut consider = |candidate: f32| {
            let dist = (residue - candidate).abs();
            if dist < best_dist - 1e-9 || (dist < best_dist + 1e-9 && candidate < best) {
                best = candidate;
                best_dist = dist;
            }
        };
        for i in 1..self.count {
            consider(self.divisions[i]);
        }
        consider(self.divisions[0] + self.scaling);
        consider(self.divisions[self.count - 1] - self.scaling);

        clamp_volts(octave * self.scaling + best)
    }

    /// Degree index and period for a quantized voltage (used by the scale
    /// detection mode's note/octave derivation as well).
    pub fn locate(&self, v: f32) -> (usize, i32) {
        let octave = (v / self.scaling).floor();
        let residue = v - octave * self.scaling;
        let mut best = 0usize;
        let mut best_dist = f32::MAX;
        for i in 0..self.count {
            let dist = (residue - self.divisions[i]).abs();
            if dist < best_dist {
                best = i;
                best_dist = dist;
            }
        }
        (best, octave as i32)
    }
}

pub fn clamp_volts(v: f32) -> f32 {
    v.clamp(-VOLT_CLAMP, VOLT_CLAMP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_degrees_is_chromatic_twelve() {
        let chromatic = ScaleMap::from_degrees(&[], 12.0, 1.0);
        let explicit = ScaleMap::from_degrees(
            &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0],
            12.0,
            1.0,
        );
        for i in -24..=24 {
            let v = i as f32 * 0.07;
            assert!((chromatic.quantize(v) - explicit.quantize(v)).abs() < 1e-6);
        }
    }

    #[test]
    fn semitones_snap_to_twelve_tet() {
        let map = ScaleMap::from_degrees(&[], 12.0, 1.0);
        // 0.51 V is just past 6 semitones (0.5 V).
        assert!((map.quantize(0.51) - 0.5).abs() < 1e-6);
        assert!((map.quantize(0.04) - 0.0).abs() < 1e-6);
        // 1.04 V → octave 1, degree 0.
        assert!((map.quantize(1.04) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn boundary_values_wrap_to_adjacent_period() {
        // Single degree at 0: anything past half a period snaps up.
        let map = ScaleMap::from_degrees(&[0.0], 12.0, 1.0);
        assert!((map.quantize(0.95) - 1.0).abs() < 1e-6);
        assert!((map.quantize(0.4) - 0.0).abs() < 1e-6);
        assert!((map.quantize(-0.05) - 0.0).abs() < 1e-6);
    }

    #[test]
    fn ties_break_to_lower_degree() {
        let map = ScaleMap::from_degrees(&[0.0, 2.0], 4.0, 1.0);
        // Degrees at 0.0 V and 0.5 V; 0.25 V is equidistant.
        assert!((map.quantize(0.25) - 0.0).abs() < 1e-6);
    }

    #[test]
    fn result_is_clamped() {
        let map = ScaleMap::from_degrees(&[], 12.0, 1.0);
        assert_eq!(map.quantize(9.3), VOLT_CLAMP);
        assert_eq!(map.quantize(-11.0), -VOLT_CLAMP);
    }

    #[test]
    fn non_finite_degrees_are_dropped() {
        // A NaN degree (0/0 in script code) must not poison the table.
        let map = ScaleMap::from_degrees(&[0.0, f32::NAN, 6.0], 12.0, 1.0);
        assert!((map.quantize(0.1) - 0.0).abs() < 1e-6);
        assert!((map.quantize(0.45) - 0.5).abs() < 1e-6);
        // Zero modulo makes every degree non-finite: quantization is a
        // plain clamp.
        let map = ScaleMap::from_degrees(&[1.0, 2.0], 0.0, 1.0);
        assert_eq!(map.quantize(1.234), 1.234);
        assert_eq!(map.quantize(8.0), VOLT_CLAMP);
    }

    #[test]
    fn major_scale_snaps_to_scale_tones() {
        let map = ScaleMap::from_degrees(&[0.0, 2.0, 4.0, 5.0, 7.0, 9.0, 11.0], 12.0, 1.0);
        // 1 semitone (0.0833 V) is closer to 0 than to 2 semitones.
        assert!((map.quantize(1.0 / 12.0) - 0.0).abs() < 1e-4);
        // 3 semitones is equidistant from 2 and 4; lower wins.
        assert!((map.quantize(3.0 / 12.0) - 2.0 / 12.0).abs() < 1e-4);
    }
}
