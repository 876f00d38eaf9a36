//! Four point pier side test
//!
//! On a German polar mount SideOfPier is meant to report the pointing state,
//! not the physical side of the pier the tube is on. Slewing to hour angles
//! -9h, -3h, +3h and +9h tells the two apart: the pointing state follows the
//! sign of the hour angle while the physical side flips beyond ±6h.

use crate::device::{ErrorKind, PierSide, PointingState};
use crate::error::ConformResult;
use crate::report::Outcome;
use crate::session::{RunContext, TestSession};
use crate::slew;
use crate::targets::{self, EquatorialTarget};
use std::fmt;

pub const PIER_TEST_HOUR_ANGLES: [f64; 4] = [-9.0, -3.0, 3.0, 9.0];

/// Sides observed at HA -9h, -3h, +3h and +9h
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PierObservations {
    pub minus9: PierSide,
    pub minus3: PierSide,
    pub plus3: PierSide,
    pub plus9: PierSide,
}

impl PierObservations {
    fn from_sides(sides: &[PierSide]) -> Option<Self> {
        match sides {
            [minus9, minus3, plus3, plus9] => Some(Self {
                minus9: *minus9,
                minus3: *minus3,
                plus3: *plus3,
                plus9: *plus9,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for PierObservations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HA -9h: {}, HA -3h: {}, HA +3h: {}, HA +9h: {}",
            self.minus9, self.minus3, self.plus3, self.plus9
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PierPattern {
    /// Sides follow the pointing state
    PointingState,
    /// Sides follow the physical side of the pier
    PhysicalSide,
    Unrecognized,
}

impl PierPattern {
    pub fn outcome(&self) -> Outcome {
        match self {
            PierPattern::PointingState => Outcome::Ok,
            PierPattern::PhysicalSide => Outcome::Issue,
            PierPattern::Unrecognized => Outcome::Info,
        }
    }
}

/// Physical side is checked first, so four identical readings count as physical
pub fn classify_pattern(obs: &PierObservations) -> PierPattern {
    if obs.minus3 == obs.plus9 && obs.plus3 == obs.minus9 {
        PierPattern::PhysicalSide
    } else if obs.minus3 == obs.minus9 && obs.plus3 == obs.plus9 {
        PierPattern::PointingState
    } else {
        PierPattern::Unrecognized
    }
}

fn pattern_message(source: &str, pattern: PierPattern, obs: &PierObservations) -> String {
    match pattern {
        PierPattern::PointingState => format!("{} reports the pointing state ({})", source, obs),
        PierPattern::PhysicalSide => format!(
            "{} reports the physical side of the pier rather than the pointing state ({})",
            source, obs
        ),
        PierPattern::Unrecognized => format!("{} pattern not recognised ({})", source, obs),
    }
}

/// Slew to the four test hour angles and classify what the mount reports
pub async fn check_pier_side(session: &TestSession<'_>, ctx: &mut RunContext) -> ConformResult<()> {
    const TEST: &str = "SideOfPier";

    if !ctx.is_german_polar() {
        session.info(TEST, "Pointing state tests only apply to German polar mounts");
        return Ok(());
    }
    let readable = match ctx.caps.side_of_pier_readable() {
        Some(readable) => readable,
        None => {
            let readable = session.call(TEST, session.device.side_of_pier()).await?.is_ok();
            ctx.caps.set_side_of_pier_readable(readable);
            readable
        }
    };
    if !readable {
        session.info(TEST, "Skipped, SideOfPier cannot be read");
        return Ok(());
    }

    let latitude = slew::site_latitude(session, ctx).await?;
    let mut actual = Vec::with_capacity(PIER_TEST_HOUR_ANGLES.len());
    let mut predicted = Vec::with_capacity(PIER_TEST_HOUR_ANGLES.len());
    let mut predicting = ctx.profile.has_destination_side_of_pier;

    for ha in PIER_TEST_HOUR_ANGLES {
        let dec = targets::halfway_to_horizon_declination(ha, latitude);
        let lst = session.require("SiderealTime", session.device.sidereal_time()).await?;
        let target = EquatorialTarget::at_hour_angle(lst, ha, dec);

        if predicting {
            match session
                .call(
                    "DestinationSideOfPier",
                    session.device.destination_side_of_pier(target.ra, target.dec),
                )
                .await?
            {
                Ok(side) => predicted.push(side),
                Err(error) if error.is(ErrorKind::NotImplemented) => {
                    session.info("DestinationSideOfPier", "DestinationSideOfPier is not implemented");
                    predicting = false;
                }
                Err(error) => session.issue(
                    "DestinationSideOfPier",
                    format!("Prediction for HA {:+.0}h Dec {:.1} raised {}", ha, dec, error),
                ),
            }
        }

        let operation = format!("{} HA {:+.0}h", TEST, ha);
        if slew::slew_to(session, ctx, &operation, target).await?.is_none() {
            session.info(TEST, "Skipped, the mount cannot slew with tracking enabled");
            return Ok(());
        }
        let side = session.require(TEST, session.device.side_of_pier()).await?;
        session.trace(TEST, &format!("HA {:+.0}h Dec {:.1}: {}", ha, dec, side));
        actual.push(side);
    }

    if let Some(obs) = PierObservations::from_sides(&actual) {
        let pattern = classify_pattern(&obs);
        session.report(pattern.outcome(), "SideOfPier (pointing state)", pattern_message(TEST, pattern, &obs));
        check_sign_convention(session, &obs);
    }
    if ctx.profile.has_destination_side_of_pier {
        match PierObservations::from_sides(&predicted) {
            Some(obs) => {
                let pattern = classify_pattern(&obs);
                session.report(
                    pattern.outcome(),
                    "DestinationSideOfPier (pointing state)",
                    pattern_message("DestinationSideOfPier", pattern, &obs),
                );
            }
            None => session.info(
                "DestinationSideOfPier (pointing state)",
                format!(
                    "Not classified, only {} of {} predictions could be read",
                    predicted.len(),
                    PIER_TEST_HOUR_ANGLES.len()
                ),
            ),
        }
    }
    Ok(())
}

/// Negative hour angles are through the pole, positive ones normal
fn check_sign_convention(session: &TestSession<'_>, obs: &PierObservations) {
    const TEST: &str = "SideOfPier (sign convention)";
    let checks = [
        (-3.0, obs.minus3, PointingState::ThroughThePole),
        (3.0, obs.plus3, PointingState::Normal),
    ];
    for (ha, side, expected) in checks {
        let state = side.pointing_state();
        session.assert(
            TEST,
            state == expected,
            format!("HA {:+.0}h reads {} ({:?}), expected {:?}", ha, side, state, expected),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities;
    use crate::config::TelescopeSettings;
    use crate::device::AlignmentMode;
    use crate::interface::InterfaceProfile;
    use crate::report::RecordingReporter;
    use crate::simulator::{SimulatedTelescope, SimulatorConfig};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn obs(sides: [PierSide; 4]) -> PierObservations {
        PierObservations::from_sides(&sides).unwrap()
    }

    #[test]
    fn test_classification_is_deterministic() {
        use PierSide::{East, West};
        assert_eq!(classify_pattern(&obs([West, West, East, East])), PierPattern::PointingState);
        assert_eq!(classify_pattern(&obs([East, West, East, West])), PierPattern::PhysicalSide);
        assert_eq!(classify_pattern(&obs([East, East, East, West])), PierPattern::Unrecognized);
        // all equal satisfies both rules, physical wins
        assert_eq!(classify_pattern(&obs([East, East, East, East])), PierPattern::PhysicalSide);
    }

    async fn run(config: SimulatorConfig) -> RecordingReporter {
        let device = SimulatedTelescope::new(config);
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        {
            let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
            let mut ctx = RunContext::new(InterfaceProfile::from_version(4));
            ctx.alignment_mode = Some(AlignmentMode::GermanPolar);
            capabilities::discover(&session, &mut ctx).await.unwrap();
            check_pier_side(&session, &mut ctx).await.unwrap();
        }
        reporter
    }

    #[tokio::test]
    async fn test_pointing_state_reporting_passes() {
        let reporter = run(SimulatorConfig::default()).await;
        assert_eq!(reporter.outcomes("SideOfPier (pointing state)"), vec![Outcome::Ok]);
        assert_eq!(reporter.outcomes("DestinationSideOfPier (pointing state)"), vec![Outcome::Ok]);
        assert_eq!(
            reporter.outcomes("SideOfPier (sign convention)"),
            vec![Outcome::Ok, Outcome::Ok]
        );
    }

    #[tokio::test]
    async fn test_physical_side_reporting_is_issue() {
        let mut config = SimulatorConfig::default();
        config.faults.report_physical_pier_side = true;
        let reporter = run(config).await;
        assert_eq!(reporter.outcomes("SideOfPier (pointing state)"), vec![Outcome::Issue]);
    }

    #[tokio::test]
    async fn test_failed_predictions_are_reported() {
        let mut config = SimulatorConfig::default();
        config.faults.failing_members.push("DestinationSideOfPier".to_string());
        let reporter = run(config).await;

        assert_eq!(reporter.outcomes("DestinationSideOfPier"), vec![Outcome::Issue; 4]);
        assert_eq!(reporter.outcomes("DestinationSideOfPier (pointing state)"), vec![Outcome::Info]);
        assert_eq!(reporter.outcomes("SideOfPier (pointing state)"), vec![Outcome::Ok]);
    }
}
