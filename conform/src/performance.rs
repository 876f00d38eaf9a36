//! Property read performance
//!
//! Informational only: each getter is called in a tight loop for the sample
//! period and the achieved call rate is reported.

use crate::device::{DeviceResult, Telescope};
use crate::error::ConformResult;
use crate::session::TestSession;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceKind {
    AtHome,
    AtPark,
    Altitude,
    Azimuth,
    Declination,
    IsPulseGuiding,
    RightAscension,
    SideOfPier,
    SiderealTime,
    Slewing,
    UtcDate,
}

impl PerformanceKind {
    pub const ALL: [PerformanceKind; 11] = [
        PerformanceKind::AtHome,
        PerformanceKind::AtPark,
        PerformanceKind::Altitude,
        PerformanceKind::Azimuth,
        PerformanceKind::Declination,
        PerformanceKind::IsPulseGuiding,
        PerformanceKind::RightAscension,
        PerformanceKind::SideOfPier,
        PerformanceKind::SiderealTime,
        PerformanceKind::Slewing,
        PerformanceKind::UtcDate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PerformanceKind::AtHome => "AtHome",
            PerformanceKind::AtPark => "AtPark",
            PerformanceKind::Altitude => "Altitude",
            PerformanceKind::Azimuth => "Azimuth",
            PerformanceKind::Declination => "Declination",
            PerformanceKind::IsPulseGuiding => "IsPulseGuiding",
            PerformanceKind::RightAscension => "RightAscension",
            PerformanceKind::SideOfPier => "SideOfPier",
            PerformanceKind::SiderealTime => "SiderealTime",
            PerformanceKind::Slewing => "Slewing",
            PerformanceKind::UtcDate => "UTCDate",
        }
    }

    async fn read(&self, device: &dyn Telescope) -> DeviceResult<()> {
        match self {
            PerformanceKind::AtHome => device.at_home().await.map(drop),
            PerformanceKind::AtPark => device.at_park().await.map(drop),
            PerformanceKind::Altitude => device.altitude().await.map(drop),
            PerformanceKind::Azimuth => device.azimuth().await.map(drop),
            PerformanceKind::Declination => device.declination().await.map(drop),
            PerformanceKind::IsPulseGuiding => device.is_pulse_guiding().await.map(drop),
            PerformanceKind::RightAscension => device.right_ascension().await.map(drop),
            PerformanceKind::SideOfPier => device.side_of_pier().await.map(drop),
            PerformanceKind::SiderealTime => device.sidereal_time().await.map(drop),
            PerformanceKind::Slewing => device.slewing().await.map(drop),
            PerformanceKind::UtcDate => device.utc_date().await.map(drop),
        }
    }
}

pub async fn check_performance(session: &TestSession<'_>) -> ConformResult<()> {
    tracing::info!("Sampling property read performance");
    for kind in PerformanceKind::ALL {
        let test = format!("Performance {}", kind.name());
        session
            .run_step(&test, async { sample(session, kind, &test).await.map(|_| ()) })
            .await?;
    }
    Ok(())
}

/// Call the getter until the sample period is over; returns calls per second
pub async fn sample(session: &TestSession<'_>, kind: PerformanceKind, test: &str) -> ConformResult<Option<f64>> {
    let budget = session.settings.performance_sample();
    let start = Instant::now();
    let mut calls = 0u64;

    while start.elapsed() < budget {
        session.check_cancelled()?;
        if let Err(error) = kind.read(session.device).await {
            session.info(test, format!("{} raised {}, sample abandoned", kind.name(), error));
            return Ok(None);
        }
        calls += 1;
    }

    let rate = calls as f64 / start.elapsed().as_secs_f64();
    session.info(test, format!("{:.1} calls per second", rate));
    Ok(Some(rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelescopeSettings;
    use crate::report::{Outcome, RecordingReporter};
    use crate::simulator::{SimulatedTelescope, SimulatorConfig};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_every_getter_is_sampled() {
        let device = SimulatedTelescope::default();
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));

        check_performance(&session).await.unwrap();

        for kind in PerformanceKind::ALL {
            let test = format!("Performance {}", kind.name());
            assert_eq!(reporter.outcomes(&test), vec![Outcome::Info], "{}", test);
        }
        assert_eq!(reporter.defects().len(), 0);
    }

    #[tokio::test]
    async fn test_failing_getter_stops_sample() {
        let mut config = SimulatorConfig::default();
        config.faults.failing_members = vec!["Altitude".to_string()];
        let device = SimulatedTelescope::new(config);
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));

        let rate = sample(&session, PerformanceKind::Altitude, "Performance Altitude")
            .await
            .unwrap();
        assert!(rate.is_none());
        assert!(reporter.for_test("Performance Altitude")[0].message.contains("abandoned"));
    }
}
