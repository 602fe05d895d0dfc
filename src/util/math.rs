//! Angle helpers shared by the simulator and the interpolation buffer

use std::f32::consts::{PI, TAU};

/// Wrap an angle into `[-π, π)`
pub fn wrap_angle(angle: f32) -> f32 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    // rem_euclid can round up to TAU for tiny negative inputs
    if wrapped >= PI {
        -PI
    } else {
        wrapped
    }
}

/// Interpolate between two angles along the shortest arc
pub fn lerp_angle(from: f32, to: f32, alpha: f32) -> f32 {
    wrap_angle(from + wrap_angle(to - from) * alpha)
}

pub fn lerp(from: f32, to: f32, alpha: f32) -> f32 {
    from + (to - from) * alpha
}

/// Replace non-finite floats with zero
pub fn finite_or_zero(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_angle_range() {
        for a in [-10.0f32, -PI, -0.5, 0.0, 0.5, PI, 3.5 * PI, 100.0] {
            let w = wrap_angle(a);
            assert!((-PI..PI).contains(&w), "{a} wrapped to {w}");
        }
    }

    #[test]
    fn test_lerp_angle_takes_short_way() {
        // 170° to -170° should pass through 180°, not through 0°
        let from = 170f32.to_radians();
        let to = (-170f32).to_radians();
        let mid = lerp_angle(from, to, 0.5);
        assert!((mid.abs() - PI).abs() < 1e-4, "mid = {mid}");
    }
}
