//! Angle and time helpers
//!
//! Right ascension and hour angle are in hours, everything else in degrees
//! unless a name says otherwise.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Ratio of a sidereal rate to a solar rate (SI seconds per sidereal second)
pub const SIDEREAL_RATE_RATIO: f64 = 1.002_737_909_35;

/// Sidereal tracking rate in arcseconds per SI second
pub const SIDEREAL_RATE_ARCSEC_PER_SEC: f64 = 15.041_067_178_7;

pub const ARCSEC_PER_DEGREE: f64 = 3600.0;

/// Arcseconds of sky covered by one hour of right ascension
pub const ARCSEC_PER_HOUR: f64 = 15.0 * ARCSEC_PER_DEGREE;

/// Wrap an hour value into [0, 24)
pub fn normalize_hours(hours: f64) -> f64 {
    let wrapped = hours.rem_euclid(24.0);
    // rem_euclid can round up to exactly 24.0 for tiny negative inputs
    if wrapped >= 24.0 {
        0.0
    } else {
        wrapped
    }
}

/// Wrap a degree value into [0, 360)
pub fn normalize_degrees(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Clamp a declination or altitude into [-90, 90]
pub fn clamp_latitude_like(degrees: f64) -> f64 {
    degrees.clamp(-90.0, 90.0)
}

/// Shortest signed difference `a - b` between two RA values, in hours [-12, 12]
pub fn ra_difference_hours(a: f64, b: f64) -> f64 {
    let mut wrapped = (a - b) % 24.0;
    if wrapped > 12.0 {
        wrapped -= 24.0;
    } else if wrapped < -12.0 {
        wrapped += 24.0;
    }
    wrapped
}

/// Shortest RA separation in arcseconds
pub fn ra_difference_arcsec(a: f64, b: f64) -> f64 {
    ra_difference_hours(a, b) * ARCSEC_PER_HOUR
}

/// Direct difference of two degree values in arcseconds
pub fn degrees_difference_arcsec(a: f64, b: f64) -> f64 {
    (a - b) * ARCSEC_PER_DEGREE
}

/// Shortest azimuth separation in arcseconds
pub fn azimuth_difference_arcsec(a: f64, b: f64) -> f64 {
    let mut diff = (a - b) % 360.0;
    if diff > 180.0 {
        diff -= 360.0;
    } else if diff < -180.0 {
        diff += 360.0;
    }
    diff * ARCSEC_PER_DEGREE
}

pub fn within_tolerance(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance
}

/// Format hours as `HH:MM:SS.ss`
pub fn format_hms(hours: f64) -> String {
    let total_centis = (normalize_hours(hours) * 360_000.0).round() as i64 % (24 * 360_000);
    let h = total_centis / 360_000;
    let m = (total_centis / 6_000) % 60;
    let s = (total_centis % 6_000) as f64 / 100.0;
    format!("{:02}:{:02}:{:05.2}", h, m, s)
}

/// Format degrees as `sDD:MM:SS.s`
pub fn format_dms(degrees: f64) -> String {
    let sign = if degrees < 0.0 { '-' } else { '+' };
    let total_tenths = (degrees.abs() * 36_000.0).round() as i64;
    let d = total_tenths / 36_000;
    let m = (total_tenths / 600) % 60;
    let s = (total_tenths % 600) as f64 / 10.0;
    format!("{}{:02}:{:02}:{:04.1}", sign, d, m, s)
}

// ============================================================================
// Sidereal time
// ============================================================================

/// Julian Day of a UTC instant, including the sub-second part
pub fn julian_day(dt: &DateTime<Utc>) -> f64 {
    let year = dt.year();
    let month = dt.month();
    let day = dt.day();

    let (y, m) = if month <= 2 {
        (year - 1, month + 12)
    } else {
        (year, month)
    };

    let a = y / 100;
    let b = 2 - a + a / 4;

    let jd = (365.25 * (y as f64 + 4716.0)).floor()
        + (30.6001 * (m as f64 + 1.0)).floor()
        + day as f64
        + b as f64
        - 1524.5;

    let seconds = dt.hour() as f64 * 3600.0
        + dt.minute() as f64 * 60.0
        + dt.second() as f64
        + dt.nanosecond() as f64 / 1e9;

    jd + seconds / 86_400.0
}

/// Local mean sidereal time in hours for a Julian Day and east-positive longitude
pub fn local_sidereal_time(jd: f64, longitude: f64) -> f64 {
    let d = jd - 2_451_545.0;
    let t = d / 36_525.0;

    // Greenwich mean sidereal time in degrees
    let gmst = 280.460_618_37 + 360.985_647_366_29 * d + 0.000_387_933 * t * t - t * t * t / 38_710_000.0;

    normalize_degrees(gmst + longitude) / 15.0
}

/// Local sidereal time for a site at the given instant
pub fn sidereal_time_at(dt: &DateTime<Utc>, longitude: f64) -> f64 {
    local_sidereal_time(julian_day(dt), longitude)
}

/// Hour angle of `ra` at sidereal time `lst`, in [-12, 12]
pub fn hour_angle(lst: f64, ra: f64) -> f64 {
    ra_difference_hours(lst, ra)
}

/// Right ascension that sits at `hour_angle` for sidereal time `lst`
pub fn ra_at_hour_angle(lst: f64, hour_angle: f64) -> f64 {
    normalize_hours(lst - hour_angle)
}

// ============================================================================
// Coordinate transforms
// ============================================================================

/// Hour angle/declination to (altitude, azimuth). Azimuth runs north through east.
pub fn equatorial_to_horizontal(hour_angle: f64, dec: f64, latitude: f64) -> (f64, f64) {
    let ha = (hour_angle * 15.0).to_radians();
    let dec = dec.to_radians();
    let lat = latitude.to_radians();

    let sin_alt = dec.sin() * lat.sin() + dec.cos() * lat.cos() * ha.cos();
    let alt = sin_alt.clamp(-1.0, 1.0).asin();

    let az = (-dec.cos() * ha.sin()).atan2(dec.sin() * lat.cos() - dec.cos() * lat.sin() * ha.cos());

    (alt.to_degrees(), normalize_degrees(az.to_degrees()))
}

/// (altitude, azimuth) to (hour angle, declination)
pub fn horizontal_to_equatorial(altitude: f64, azimuth: f64, latitude: f64) -> (f64, f64) {
    let alt = altitude.to_radians();
    let az = azimuth.to_radians();
    let lat = latitude.to_radians();

    let sin_dec = alt.sin() * lat.sin() + alt.cos() * lat.cos() * az.cos();
    let dec = sin_dec.clamp(-1.0, 1.0).asin();

    let ha = (-az.sin() * alt.cos()).atan2(lat.cos() * alt.sin() - lat.sin() * alt.cos() * az.cos());

    (ra_difference_hours(ha.to_degrees() / 15.0, 0.0), dec.to_degrees())
}

/// Altitude of a target at the given hour angle and declination
pub fn altitude_at(hour_angle: f64, dec: f64, latitude: f64) -> f64 {
    equatorial_to_horizontal(hour_angle, dec, latitude).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_hours() {
        assert_eq!(normalize_hours(25.5), 1.5);
        assert_eq!(normalize_hours(-1.0), 23.0);
        assert_eq!(normalize_hours(0.0), 0.0);
        assert!(normalize_hours(-1e-18) < 24.0);
    }

    #[test]
    fn test_normalize_degrees() {
        assert_eq!(normalize_degrees(370.0), 10.0);
        assert_eq!(normalize_degrees(-10.0), 350.0);
    }

    #[test]
    fn test_ra_difference_wraps_at_24h() {
        assert!((ra_difference_hours(23.9, 0.1) - -0.2).abs() < 1e-9);
        assert!((ra_difference_hours(0.1, 23.9) - 0.2).abs() < 1e-9);
        assert!((ra_difference_hours(6.0, 5.0) - 1.0).abs() < 1e-9);
        assert!((ra_difference_arcsec(0.0, 23.0 + 59.0 / 60.0) - 900.0).abs() < 1e-6);
    }

    #[test]
    fn test_azimuth_difference_wraps_at_360() {
        assert!((azimuth_difference_arcsec(359.5, 0.5) - -3600.0).abs() < 1e-6);
        assert!((azimuth_difference_arcsec(10.0, 9.0) - 3600.0).abs() < 1e-6);
    }

    #[test]
    fn test_format_hms_and_dms() {
        assert_eq!(format_hms(12.5), "12:30:00.00");
        assert_eq!(format_hms(23.999_999_999), "00:00:00.00");
        assert_eq!(format_dms(-45.5), "-45:30:00.0");
        assert_eq!(format_dms(2.0), "+02:00:00.0");
    }

    #[test]
    fn test_julian_day_j2000() {
        let dt = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((julian_day(&dt) - 2_451_545.0).abs() < 1e-9);
    }

    #[test]
    fn test_greenwich_sidereal_time_at_j2000() {
        let lst = local_sidereal_time(2_451_545.0, 0.0);
        assert!((lst - 18.697_374_558).abs() < 1e-6);
    }

    #[test]
    fn test_longitude_shifts_sidereal_time() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 20, 22, 15, 0).unwrap();
        let greenwich = sidereal_time_at(&dt, 0.0);
        let east = sidereal_time_at(&dt, 30.0);
        assert!((ra_difference_hours(east, greenwich) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_hour_angle_round_trip() {
        let lst = 3.0;
        let ra = ra_at_hour_angle(lst, -4.0);
        assert!((ra - 7.0).abs() < 1e-12);
        assert!((hour_angle(lst, ra) - -4.0).abs() < 1e-12);
    }

    #[test]
    fn test_meridian_transit_altitude() {
        // On the meridian altitude = 90 - |lat - dec|
        let (alt, az) = equatorial_to_horizontal(0.0, 20.0, 50.0);
        assert!((alt - 60.0).abs() < 1e-9);
        assert!((az - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_eastern_target_has_eastern_azimuth() {
        let (_, az) = equatorial_to_horizontal(-3.0, 10.0, 51.0);
        assert!(az > 0.0 && az < 180.0);
    }

    #[test]
    fn test_horizontal_equatorial_round_trip() {
        for &(ha, dec) in &[(-5.0, 10.0), (2.5, 60.0), (8.0, -20.0), (-11.0, 75.0)] {
            let (alt, az) = equatorial_to_horizontal(ha, dec, 40.0);
            let (ha2, dec2) = horizontal_to_equatorial(alt, az, 40.0);
            assert!((ra_difference_hours(ha2, ha)).abs() < 1e-9, "ha {} -> {}", ha, ha2);
            assert!((dec2 - dec).abs() < 1e-9);
        }
    }
}
