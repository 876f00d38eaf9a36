//! Conformance run sequencer
//!
//! Drives one run through its phases in order. Every phase works through the
//! same [`TestSession`] and [`RunContext`]; cancellation stops the sequence
//! at the next device call but the post-run safety steps still execute.

use crate::capabilities::{self, Capability};
use crate::classify::Requirement;
use crate::config::TelescopeSettings;
use crate::device::Telescope;
use crate::error::{ConformError, ConformResult};
use crate::interface::InterfaceProfile;
use crate::methods;
use crate::performance;
use crate::pier_side;
use crate::properties;
use crate::rate_offset;
use crate::report::{Reporter, RunSummary};
use crate::session::{RunContext, TestSession};
use crate::slew;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Interface version assumed when the device cannot report one
const FALLBACK_INTERFACE_VERSION: i16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    PreRun,
    Capabilities,
    Properties,
    Methods,
    Performance,
    PostRun,
    ConfigurationReport,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::PreRun => write!(f, "Pre-run checks"),
            RunPhase::Capabilities => write!(f, "Capabilities"),
            RunPhase::Properties => write!(f, "Properties"),
            RunPhase::Methods => write!(f, "Methods"),
            RunPhase::Performance => write!(f, "Performance"),
            RunPhase::PostRun => write!(f, "Post-run checks"),
            RunPhase::ConfigurationReport => write!(f, "Configuration report"),
        }
    }
}

/// Progress notifications for anyone watching a run
#[derive(Debug, Clone, Serialize)]
pub enum TesterEvent {
    PhaseStarted(RunPhase),
    Finished(RunSummary),
}

pub struct ConformanceTester<'a> {
    device: &'a dyn Telescope,
    settings: &'a TelescopeSettings,
    reporter: &'a dyn Reporter,
    cancel: Arc<AtomicBool>,
    event_tx: broadcast::Sender<TesterEvent>,
}

impl<'a> ConformanceTester<'a> {
    pub fn new(device: &'a dyn Telescope, settings: &'a TelescopeSettings, reporter: &'a dyn Reporter) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            device,
            settings,
            reporter,
            cancel: Arc::new(AtomicBool::new(false)),
            event_tx,
        }
    }

    /// Flag that stops the run when set
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TesterEvent> {
        self.event_tx.subscribe()
    }

    fn enter(&self, phase: RunPhase) {
        tracing::info!("=== {} ===", phase);
        let _ = self.event_tx.send(TesterEvent::PhaseStarted(phase));
    }

    /// Run every phase and summarise the outcome
    pub async fn run(&self) -> RunSummary {
        let start = Instant::now();
        let session = TestSession::new(self.device, self.settings, self.reporter, self.cancel.clone());
        let mut ctx = RunContext::default();

        let cancelled = match self.run_phases(&session, &mut ctx).await {
            Ok(()) => false,
            Err(ConformError::Cancelled) => {
                tracing::warn!("Conformance run cancelled");
                true
            }
            Err(e) => {
                tracing::error!("Conformance run stopped: {}", e);
                session.error("Conformance run", e.to_string());
                false
            }
        };

        self.enter(RunPhase::PostRun);
        self.post_run(&session, &ctx).await;

        self.enter(RunPhase::ConfigurationReport);
        for group in self.settings.disabled_groups() {
            session.alert(&format!("{} disabled", group));
        }

        let summary = RunSummary {
            counts: session.counts(),
            cancelled,
            elapsed: start.elapsed(),
        };
        tracing::info!("Conformance run finished: {}", summary);
        let _ = self.event_tx.send(TesterEvent::Finished(summary.clone()));
        summary
    }

    async fn run_phases(&self, session: &TestSession<'_>, ctx: &mut RunContext) -> ConformResult<()> {
        self.enter(RunPhase::PreRun);
        pre_run(session, ctx).await?;

        self.enter(RunPhase::Capabilities);
        session.check_cancelled()?;
        session
            .run_step("Capabilities", capabilities::discover(session, ctx))
            .await?;

        if self.settings.test_properties {
            self.enter(RunPhase::Properties);
            session.check_cancelled()?;
            properties::check_properties(session, ctx).await?;
        }

        if self.settings.test_methods {
            self.enter(RunPhase::Methods);
            session.check_cancelled()?;
            methods::check_methods(session, ctx).await?;
            slew::check_slews(session, ctx).await?;
            if self.settings.methods.side_of_pier_read {
                session
                    .run_step("SideOfPier", pier_side::check_pier_side(session, ctx))
                    .await?;
            }
            rate_offset::check_rate_offsets(session, ctx).await?;
        }

        if self.settings.test_performance {
            self.enter(RunPhase::Performance);
            session.check_cancelled()?;
            performance::check_performance(session).await?;
        }
        Ok(())
    }

    /// Stop any motion and switch tracking off.
    ///
    /// Runs after cancellation too, so it calls the device directly.
    async fn post_run(&self, session: &TestSession<'_>, ctx: &RunContext) {
        if let Err(e) = self.device.abort_slew().await {
            session.issue("Post-run AbortSlew", format!("AbortSlew raised {}", e));
        }

        let can_set_tracking =
            !ctx.caps.is_known(Capability::CanSetTracking) || ctx.caps.get(Capability::CanSetTracking);
        if can_set_tracking {
            match self.device.set_tracking(false).await {
                Ok(()) => session.ok("Post-run Tracking", "Tracking disabled"),
                Err(e) => session.issue("Post-run Tracking", format!("Unable to disable tracking: {}", e)),
            }
        }
    }
}

/// Read the common members, build the interface profile and get the mount ready
async fn pre_run(session: &TestSession<'_>, ctx: &mut RunContext) -> ConformResult<()> {
    let device = session.device;

    let text_members = [
        ("Name", device.name()),
        ("Description", device.description()),
        ("DriverInfo", device.driver_info()),
        ("DriverVersion", device.driver_version()),
    ];
    for (member, call) in text_members {
        if let Some(value) = session.check(member, Requirement::Optional, call).await? {
            session.ok(member, value);
        }
    }

    let version = session
        .check("InterfaceVersion", Requirement::Optional, device.interface_version())
        .await?;
    if let Some(version) = version {
        session.ok("InterfaceVersion", version.to_string());
    }
    ctx.profile = InterfaceProfile::from_version(version.unwrap_or(FALLBACK_INTERFACE_VERSION));
    session.info("InterfaceVersion", format!("Testing against {}", ctx.profile.generation));

    if let Some(actions) = session
        .check("SupportedActions", Requirement::Optional, device.supported_actions())
        .await?
    {
        session.ok("SupportedActions", format!("{} actions listed", actions.len()));
    }

    // later phases need the mount geometry even when property tests are off
    if let Ok(mode) = session.call("AlignmentMode", device.alignment_mode()).await? {
        ctx.alignment_mode = Some(mode);
    }

    prepare_mount(session).await
}

/// Unpark, let any slew finish and start tracking. The mount may refuse.
async fn prepare_mount(session: &TestSession<'_>) -> ConformResult<()> {
    const TEST: &str = "Mount preparation";
    let device = session.device;

    if let Ok(true) = session.call("AtPark", device.at_park()).await? {
        match session.call("Unpark", device.unpark()).await? {
            Ok(()) => {
                let waited = session
                    .wait_while(
                        "Unpark",
                        move || async move { device.at_park().await },
                        Duration::ZERO,
                        session.settings.maximum_slew_time(),
                    )
                    .await;
                match waited {
                    Ok(_) => session.info(TEST, "Mount was parked and has been unparked"),
                    Err(ConformError::Cancelled) => return Err(ConformError::Cancelled),
                    Err(e) => session.info(TEST, format!("Unpark did not complete: {}", e)),
                }
            }
            Err(e) => session.info(TEST, format!("Mount is parked and Unpark raised {}", e)),
        }
    }

    match session.wait_for_slew("Slewing", Duration::ZERO).await {
        Ok(_) => {}
        Err(ConformError::Cancelled) => return Err(ConformError::Cancelled),
        Err(e) => session.info(TEST, format!("Mount did not stop slewing: {}", e)),
    }

    match session.call("Tracking", device.tracking()).await? {
        Ok(true) => {}
        Ok(false) => {
            if let Err(e) = session.call("Tracking", device.set_tracking(true)).await? {
                session.info(TEST, format!("Tracking could not be enabled: {}", e));
            }
        }
        Err(e) => session.info(TEST, format!("Tracking could not be read: {}", e)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Outcome, RecordingReporter};
    use crate::simulator::{SimulatedTelescope, SimulatorConfig};

    #[tokio::test]
    async fn test_full_run_on_simulator_is_conformant() {
        let device = SimulatedTelescope::default();
        let mut settings = TelescopeSettings::fast_for_tests();
        settings.test_performance = true;
        let reporter = RecordingReporter::new();
        let tester = ConformanceTester::new(&device, &settings, &reporter);
        let mut events = tester.subscribe();

        let summary = tester.run().await;

        assert!(summary.is_conformant(), "{:?}", reporter.defects());
        assert!(summary.counts.ok > 50);
        assert!(!device.tracking().await.unwrap());
        assert!(matches!(
            events.try_recv(),
            Ok(TesterEvent::PhaseStarted(RunPhase::PreRun))
        ));
        assert!(reporter
            .alerts()
            .iter()
            .any(|a| a.starts_with("Extended site property tests")));
    }

    #[tokio::test]
    async fn test_cancelled_run_still_disables_tracking() {
        let device = SimulatedTelescope::default();
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let tester = ConformanceTester::new(&device, &settings, &reporter);
        tester.cancel();

        let summary = tester.run().await;

        assert!(summary.cancelled);
        assert!(!summary.is_conformant());
        assert!(reporter.has("Post-run Tracking", Outcome::Ok));
        assert!(!device.tracking().await.unwrap());
    }

    #[tokio::test]
    async fn test_faulty_device_is_not_conformant() {
        let mut config = SimulatorConfig::default();
        config.faults.slewing_never_set = true;
        config.faults.accept_out_of_range_site = true;
        let device = SimulatedTelescope::new(config);
        let mut settings = TelescopeSettings::fast_for_tests();
        settings.test_methods = false;
        let reporter = RecordingReporter::new();
        let tester = ConformanceTester::new(&device, &settings, &reporter);

        let summary = tester.run().await;

        assert!(!summary.cancelled);
        assert!(summary.counts.issues > 0);
        assert!(reporter.has("SiteLatitude Write", Outcome::Issue));
    }

    #[tokio::test]
    async fn test_old_interface_uses_v1_profile() {
        let mut config = SimulatorConfig::default();
        config.interface_version = 1;
        let device = SimulatedTelescope::new(config);
        let mut settings = TelescopeSettings::fast_for_tests();
        settings.test_properties = false;
        let reporter = RecordingReporter::new();
        let tester = ConformanceTester::new(&device, &settings, &reporter);

        let summary = tester.run().await;

        assert!(summary.is_conformant(), "{:?}", reporter.defects());
        assert_eq!(reporter.outcomes("MoveAxis"), vec![Outcome::Info]);
    }
}
