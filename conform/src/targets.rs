//! Test target selection
//!
//! Targets are derived from the current sidereal time plus an hour-angle
//! offset. Declinations are picked so the target is reachable: above the
//! horizon and below the elevation ceiling near the pole.

use crate::angles::{self, format_dms, format_hms};
use std::fmt;

/// Highest elevation a test target may have
pub const ELEVATION_CEILING_DEG: f64 = 65.0;

/// Spacing of candidate test declinations
pub const DECLINATION_STEP_DEG: f64 = 10.0;

/// Candidate declinations stop this far from the poles
pub const DECLINATION_LIMIT_DEG: f64 = 80.0;

/// Fraction of the way from the horizon to the pole used for pier-side targets
pub const HALFWAY_FRACTION: f64 = 0.5;

/// Below this |latitude| the horizon declination is taken as zero
const EQUATOR_LATITUDE_DEG: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EquatorialTarget {
    /// Hours, [0, 24)
    pub ra: f64,
    /// Degrees, [-90, 90]
    pub dec: f64,
}

impl EquatorialTarget {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self {
            ra: angles::normalize_hours(ra),
            dec: angles::clamp_latitude_like(dec),
        }
    }

    /// Target at `hour_angle` hours from the meridian for sidereal time `lst`
    pub fn at_hour_angle(lst: f64, hour_angle: f64, dec: f64) -> Self {
        Self::new(angles::ra_at_hour_angle(lst, hour_angle), dec)
    }
}

impl fmt::Display for EquatorialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RA {} Dec {}", format_hms(self.ra), format_dms(self.dec))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HorizontalTarget {
    /// Degrees, [-90, 90]
    pub altitude: f64,
    /// Degrees, [0, 360)
    pub azimuth: f64,
}

impl HorizontalTarget {
    pub fn new(altitude: f64, azimuth: f64) -> Self {
        Self {
            altitude: angles::clamp_latitude_like(altitude),
            azimuth: angles::normalize_degrees(azimuth),
        }
    }
}

impl fmt::Display for HorizontalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Alt {} Az {}", format_dms(self.altitude), format_dms(self.azimuth))
    }
}

/// Candidate declinations from -80 to +80 in 10 degree steps
fn candidate_declinations() -> impl Iterator<Item = f64> {
    let steps = (2.0 * DECLINATION_LIMIT_DEG / DECLINATION_STEP_DEG).round() as i32;
    (0..=steps).map(|i| -DECLINATION_LIMIT_DEG + i as f64 * DECLINATION_STEP_DEG)
}

/// Declination giving the highest elevation that stays under the ceiling.
///
/// Falls back to the celestial equator when no candidate is above the horizon.
pub fn test_declination(hour_angle: f64, latitude: f64) -> f64 {
    let mut best: Option<(f64, f64)> = None;

    for dec in candidate_declinations() {
        let altitude = angles::altitude_at(hour_angle, dec, latitude);
        if altitude > ELEVATION_CEILING_DEG || altitude <= 0.0 {
            continue;
        }
        match best {
            Some((_, best_alt)) if best_alt >= altitude => {}
            _ => best = Some((dec, altitude)),
        }
    }

    best.map(|(dec, _)| dec).unwrap_or(0.0)
}

/// Declination on the horizon at the given hour angle
pub fn horizon_declination(hour_angle: f64, latitude: f64) -> f64 {
    if latitude.abs() < EQUATOR_LATITUDE_DEG {
        return 0.0;
    }
    let ha = (hour_angle * 15.0).to_radians();
    (-ha.cos() / latitude.to_radians().tan()).atan().to_degrees()
}

/// Declination halfway between the horizon and the visible pole at `hour_angle`
pub fn halfway_to_horizon_declination(hour_angle: f64, latitude: f64) -> f64 {
    let horizon = horizon_declination(hour_angle, latitude);
    let pole = if latitude >= 0.0 { 90.0 } else { -90.0 };
    horizon + HALFWAY_FRACTION * (pole - horizon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_are_normalized() {
        let t = EquatorialTarget::at_hour_angle(1.0, 3.0, 95.0);
        assert!((t.ra - 22.0).abs() < 1e-12);
        assert_eq!(t.dec, 90.0);

        let h = HorizontalTarget::new(-100.0, 400.0);
        assert_eq!(h.altitude, -90.0);
        assert!((h.azimuth - 40.0).abs() < 1e-12);
    }

    #[test]
    fn test_candidates_span_minus_80_to_80() {
        let all: Vec<f64> = candidate_declinations().collect();
        assert_eq!(all.len(), 17);
        assert_eq!(all[0], -80.0);
        assert_eq!(all[16], 80.0);
    }

    #[test]
    fn test_declination_is_highest_candidate_under_ceiling() {
        for &(ha, lat) in &[(1.0, 51.0), (-2.0, 35.0), (4.0, -33.0), (0.0, 0.0)] {
            let dec = test_declination(ha, lat);
            let alt = angles::altitude_at(ha, dec, lat);
            assert!(alt > 0.0 && alt <= ELEVATION_CEILING_DEG, "ha {} lat {} alt {}", ha, lat, alt);
            for other in candidate_declinations() {
                let other_alt = angles::altitude_at(ha, other, lat);
                if other_alt > 0.0 && other_alt <= ELEVATION_CEILING_DEG {
                    assert!(other_alt <= alt + 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_horizon_declination_is_on_horizon() {
        for &ha in &[-9.0, -3.0, 3.0, 9.0] {
            let dec = horizon_declination(ha, 51.0);
            assert!(angles::altitude_at(ha, dec, 51.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_halfway_targets_are_above_horizon() {
        for &lat in &[51.0, -33.0] {
            for &ha in &[-9.0, -3.0, 3.0, 9.0] {
                let dec = halfway_to_horizon_declination(ha, lat);
                assert!(angles::altitude_at(ha, dec, lat) > 0.0, "lat {} ha {}", lat, ha);
            }
        }
    }

    #[test]
    fn test_halfway_declination_values() {
        // At HA ±3h from 51N the horizon sits near -29.8 degrees
        let dec = halfway_to_horizon_declination(3.0, 51.0);
        let horizon = horizon_declination(3.0, 51.0);
        assert!((dec - (horizon + 0.5 * (90.0 - horizon))).abs() < 1e-12);
        assert!((horizon - -29.8).abs() < 0.1);

        let south = halfway_to_horizon_declination(3.0, -51.0);
        assert!((south + dec).abs() < 1e-9);
    }
}
