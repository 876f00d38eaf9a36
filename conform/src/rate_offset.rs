//! Rate offset measurement
//!
//! Applies a RightAscensionRate or DeclinationRate offset while tracking and
//! measures how far the mount actually moves. On interfaces that tie offsets
//! to sidereal tracking it also checks that other drive rates zero them.

use crate::angles::{self, SIDEREAL_RATE_RATIO};
use crate::capabilities::Capability;
use crate::device::{DriveRate, ErrorKind};
use crate::error::ConformResult;
use crate::session::{RunContext, TestSession};
use crate::slew;
use crate::targets;
use std::fmt;
use std::time::Instant;

/// Allowed relative error of a measured rate
pub const RELATIVE_TOLERANCE: f64 = 0.05;

/// Below this expected rate, arcseconds per second, the tolerance is absolute
const ABSOLUTE_TOLERANCE_ARCSEC_PER_SEC: f64 = 0.05;

pub const OFFSET_TEST_HOUR_ANGLES: [f64; 2] = [-3.0, 3.0];

/// Non-zero value written while tracking at a non-sidereal rate
const NON_SIDEREAL_OFFSET: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetAxis {
    RightAscension,
    Declination,
}

impl OffsetAxis {
    pub const ALL: [OffsetAxis; 2] = [OffsetAxis::RightAscension, OffsetAxis::Declination];

    pub fn member(&self) -> &'static str {
        match self {
            OffsetAxis::RightAscension => "RightAscensionRate",
            OffsetAxis::Declination => "DeclinationRate",
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            OffsetAxis::RightAscension => Capability::CanSetRightAscensionRate,
            OffsetAxis::Declination => Capability::CanSetDeclinationRate,
        }
    }

    /// Property value giving a motion of `arcsec_per_sec`.
    ///
    /// RightAscensionRate is in seconds of RA per sidereal second,
    /// DeclinationRate in arcseconds per SI second.
    pub fn property_value(&self, arcsec_per_sec: f64) -> f64 {
        match self {
            OffsetAxis::RightAscension => arcsec_per_sec / (15.0 * SIDEREAL_RATE_RATIO),
            OffsetAxis::Declination => arcsec_per_sec,
        }
    }
}

impl fmt::Display for OffsetAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.member())
    }
}

/// Whether a measured rate is close enough to the expected one
pub fn rate_matches(measured: f64, expected: f64) -> bool {
    let tolerance = (expected.abs() * RELATIVE_TOLERANCE).max(ABSOLUTE_TOLERANCE_ARCSEC_PER_SEC);
    angles::within_tolerance(measured, expected, tolerance)
}

pub async fn check_rate_offsets(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    if ctx.profile.offsets_require_sidereal {
        session
            .run_step("Rate offsets (non-sidereal)", check_non_sidereal(session, ctx))
            .await?;
    }

    if !session.settings.extended_rate_offset_tests {
        return Ok(());
    }

    let settings = session.settings;
    let rates = [
        settings.rate_offset_high_arcsec_per_sec,
        -settings.rate_offset_high_arcsec_per_sec,
        settings.rate_offset_low_arcsec_per_sec,
        -settings.rate_offset_low_arcsec_per_sec,
    ];

    for axis in OffsetAxis::ALL {
        if !ctx.caps.get(axis.capability()) {
            continue;
        }
        let test = format!("{} Offset", axis);
        for ha in OFFSET_TEST_HOUR_ANGLES {
            for rate in rates {
                session.run_step(&test, test_offset_rate(session, ctx, ha, axis, rate)).await?;
            }
        }
    }
    Ok(())
}

/// Slew to `hour_angle`, apply the offset and measure the resulting motion
pub async fn test_offset_rate(
    session: &TestSession<'_>,
    ctx: &RunContext,
    hour_angle: f64,
    axis: OffsetAxis,
    arcsec_per_sec: f64,
) -> ConformResult<()> {
    let test = format!("{} Offset", axis);
    let device = session.device;

    let latitude = slew::site_latitude(session, ctx).await?;
    let dec = targets::test_declination(hour_angle, latitude);
    if slew::slew_to_hour_angle(session, ctx, &test, hour_angle, dec).await?.is_none() {
        session.info(&test, "Skipped, the mount cannot slew with tracking enabled");
        return Ok(());
    }

    let value = axis.property_value(arcsec_per_sec);
    let write = match axis {
        OffsetAxis::RightAscension => device.set_right_ascension_rate(value),
        OffsetAxis::Declination => device.set_declination_rate(value),
    };
    if let Err(error) = session.call(axis.member(), write).await? {
        session.issue(&test, format!("Unable to set {} to {:.6}: {}", axis, value, error));
        return Ok(());
    }

    let measured = measure(session, axis).await;
    restore_zero(session, axis, &test).await?;
    let measured = measured?;

    let message = format!(
        "HA {:+.0}h: measured {:+.3}\"/s, expected {:+.3}\"/s",
        hour_angle, measured, arcsec_per_sec
    );
    session.assert(&test, rate_matches(measured, arcsec_per_sec), message);
    Ok(())
}

async fn measure(session: &TestSession<'_>, axis: OffsetAxis) -> ConformResult<f64> {
    let (start_position, start) = read_position(session, axis).await?;
    session.pause(session.settings.rate_offset_duration()).await?;
    let (end_position, end) = read_position(session, axis).await?;

    let moved = match axis {
        OffsetAxis::RightAscension => angles::ra_difference_arcsec(end_position, start_position),
        OffsetAxis::Declination => angles::degrees_difference_arcsec(end_position, start_position),
    };
    Ok(moved / (end - start).as_secs_f64())
}

/// Position on the measured axis and the instant it was read
async fn read_position(session: &TestSession<'_>, axis: OffsetAxis) -> ConformResult<(f64, Instant)> {
    let device = session.device;
    let position = match axis {
        OffsetAxis::RightAscension => session.require("RightAscension", device.right_ascension()).await?,
        OffsetAxis::Declination => session.require("Declination", device.declination()).await?,
    };
    Ok((position, Instant::now()))
}

async fn restore_zero(session: &TestSession<'_>, axis: OffsetAxis, test: &str) -> ConformResult<()> {
    let device = session.device;
    let write = match axis {
        OffsetAxis::RightAscension => device.set_right_ascension_rate(0.0),
        OffsetAxis::Declination => device.set_declination_rate(0.0),
    };
    if let Err(error) = session.call(axis.member(), write).await? {
        session.issue(test, format!("Unable to restore {} to zero: {}", axis, error));
    }
    Ok(())
}

// =============================================================================
// NON-SIDEREAL TRACKING
// =============================================================================

async fn check_non_sidereal(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    let device = session.device;
    let rates = if ctx.tracking_rates.is_empty() {
        match session.call("TrackingRates", device.tracking_rates()).await? {
            Ok(rates) => rates,
            Err(_) => Vec::new(),
        }
    } else {
        ctx.tracking_rates.clone()
    };

    let rate = match rates.into_iter().find(|r| *r != DriveRate::Sidereal) {
        Some(rate) => rate,
        None => {
            session.info("Rate offsets (non-sidereal)", "Skipped, only sidereal tracking is supported");
            return Ok(());
        }
    };

    let original = session.require("TrackingRate", device.tracking_rate()).await?;
    if let Err(error) = session.call("TrackingRate", device.set_tracking_rate(rate)).await? {
        session.info(
            "Rate offsets (non-sidereal)",
            format!("Skipped, TrackingRate could not be set to {}: {}", rate, error),
        );
        return Ok(());
    }

    let result = verify_offsets_locked(session, ctx, rate).await;

    if let Err(error) = session.call("TrackingRate", device.set_tracking_rate(original)).await? {
        session.issue(
            "Rate offsets (non-sidereal)",
            format!("Unable to restore TrackingRate to {}: {}", original, error),
        );
    }
    result
}

/// Offsets read zero and refuse writes while tracking at `rate`
async fn verify_offsets_locked(session: &TestSession<'_>, ctx: &RunContext, rate: DriveRate) -> ConformResult<()> {
    let device = session.device;

    for axis in OffsetAxis::ALL {
        let test = format!("{} ({})", axis, rate);
        let read = match axis {
            OffsetAxis::RightAscension => device.right_ascension_rate(),
            OffsetAxis::Declination => device.declination_rate(),
        };
        match session.call(axis.member(), read).await? {
            Ok(value) => session.assert(
                &test,
                value == 0.0,
                format!("{} reads {} while tracking at {} rate", axis, value, rate),
            ),
            Err(error) => session.issue(&test, format!("{} could not be read: {}", axis, error)),
        }

        if !ctx.caps.get(axis.capability()) {
            continue;
        }
        let write = match axis {
            OffsetAxis::RightAscension => device.set_right_ascension_rate(NON_SIDEREAL_OFFSET),
            OffsetAxis::Declination => device.set_declination_rate(NON_SIDEREAL_OFFSET),
        };
        match session.call(axis.member(), write).await? {
            Err(error) if error.is(ErrorKind::InvalidOperation) => {
                session.ok(&test, format!("Write correctly rejected with InvalidOperation at {} rate", rate));
            }
            Err(error) => session.issue(
                &test,
                format!("Write at {} rate raised {} instead of InvalidOperation", rate, error.kind),
            ),
            Ok(()) => {
                session.issue(
                    &test,
                    format!("Write of {} accepted while tracking at {} rate", NON_SIDEREAL_OFFSET, rate),
                );
                restore_zero(session, axis, &test).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities;
    use crate::config::TelescopeSettings;
    use crate::device::Telescope;
    use crate::interface::InterfaceProfile;
    use crate::report::{Outcome, RecordingReporter};
    use crate::simulator::{SimulatedTelescope, SimulatorConfig};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_rate_tolerance() {
        assert!(rate_matches(2.09, 2.0));
        assert!(!rate_matches(2.2, 2.0));
        assert!(rate_matches(0.04, 0.0));
        assert!(!rate_matches(0.1, 0.0));
    }

    #[test]
    fn test_ra_property_units() {
        let value = OffsetAxis::RightAscension.property_value(15.0 * SIDEREAL_RATE_RATIO);
        assert!((value - 1.0).abs() < 1e-12);
        assert_eq!(OffsetAxis::Declination.property_value(2.5), 2.5);
    }

    #[tokio::test]
    async fn test_offsets_measured_on_simulator() {
        let device = SimulatedTelescope::default();
        let mut settings = TelescopeSettings::fast_for_tests();
        settings.extended_rate_offset_tests = true;
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let mut ctx = RunContext::new(InterfaceProfile::from_version(4));
        capabilities::discover(&session, &mut ctx).await.unwrap();

        check_rate_offsets(&session, &ctx).await.unwrap();

        assert!(reporter.defects().is_empty(), "{:?}", reporter.defects());
        assert_eq!(reporter.outcomes("RightAscensionRate Offset").len(), 8);
        assert_eq!(reporter.outcomes("DeclinationRate Offset").len(), 8);
        assert!(reporter.has("RightAscensionRate (Lunar)", Outcome::Ok));
        assert_eq!(device.tracking_rate().await.unwrap(), DriveRate::Sidereal);
        assert_eq!(device.right_ascension_rate().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_ignored_offsets_are_issues() {
        let mut config = SimulatorConfig::default();
        config.faults.rate_offsets_ignored = true;
        let device = SimulatedTelescope::new(config);
        let mut settings = TelescopeSettings::fast_for_tests();
        settings.extended_rate_offset_tests = true;
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let mut ctx = RunContext::new(InterfaceProfile::from_version(4));
        capabilities::discover(&session, &mut ctx).await.unwrap();

        check_rate_offsets(&session, &ctx).await.unwrap();

        for test in ["RightAscensionRate Offset", "DeclinationRate Offset"] {
            let outcomes = reporter.outcomes(test);
            assert_eq!(outcomes.len(), 8, "{}", test);
            assert!(outcomes.iter().all(|o| *o == Outcome::Issue), "{}: {:?}", test, outcomes);
        }
    }

    #[tokio::test]
    async fn test_measured_rate_matches_applied_offset() {
        let device = SimulatedTelescope::default();
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        device.set_tracking(true).await.unwrap();
        device.set_declination_rate(100.0).await.unwrap();

        let measured = measure(&session, OffsetAxis::Declination).await.unwrap();

        assert!(rate_matches(measured, 100.0), "measured {}", measured);
    }
}
