//! Test session and run context
//!
//! [`TestSession`] bundles what every check needs: the device, the settings,
//! the reporter and the cancellation flag. It owns the small set of helpers
//! that turn device calls into outcome records.
//!
//! [`RunContext`] is the state threaded through the phases: interface profile,
//! capability registry and the last observed device values. Steps that depend
//! on earlier results take it by reference so the dependency is visible.

use crate::capabilities::CapabilityRegistry;
use crate::classify::{self, Requirement, Verdict};
use crate::config::TelescopeSettings;
use crate::device::{AlignmentMode, AxisRate, DeviceResult, DriveRate, PierSide, Telescope};
use crate::error::{ConformError, ConformResult};
use crate::interface::InterfaceProfile;
use crate::report::{Outcome, OutcomeCounts, OutcomeRecord, Reporter};
use crate::waiter::{self, WaitOutcome};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// RUN CONTEXT
// =============================================================================

/// Last values read from the device
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub right_ascension: Option<f64>,
    pub declination: Option<f64>,
    pub altitude: Option<f64>,
    pub azimuth: Option<f64>,
    pub tracking: Option<bool>,
    pub slewing: Option<bool>,
    pub side_of_pier: Option<PierSide>,
    pub site_latitude: Option<f64>,
    pub site_longitude: Option<f64>,
    pub site_elevation: Option<f64>,
    pub sidereal_time: Option<f64>,
}

/// State shared by the phases of one run
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub profile: InterfaceProfile,
    pub caps: CapabilityRegistry,
    pub snapshot: DeviceSnapshot,
    pub alignment_mode: Option<AlignmentMode>,
    pub tracking_rates: Vec<DriveRate>,
    pub axis_rates: [Vec<AxisRate>; 3],
}

impl RunContext {
    pub fn new(profile: InterfaceProfile) -> Self {
        Self {
            profile,
            ..Self::default()
        }
    }

    pub fn is_german_polar(&self) -> bool {
        self.alignment_mode == Some(AlignmentMode::GermanPolar)
    }
}

// =============================================================================
// TEST SESSION
// =============================================================================

pub struct TestSession<'a> {
    pub device: &'a dyn Telescope,
    pub settings: &'a TelescopeSettings,
    reporter: &'a dyn Reporter,
    cancel: Arc<AtomicBool>,
    counts: Mutex<OutcomeCounts>,
}

impl<'a> TestSession<'a> {
    pub fn new(
        device: &'a dyn Telescope,
        settings: &'a TelescopeSettings,
        reporter: &'a dyn Reporter,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            device,
            settings,
            reporter,
            cancel,
            counts: Mutex::new(OutcomeCounts::default()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn check_cancelled(&self) -> ConformResult<()> {
        if self.is_cancelled() {
            Err(ConformError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn counts(&self) -> OutcomeCounts {
        *self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -------------------------------------------------------------------------
    // Reporting
    // -------------------------------------------------------------------------

    pub fn report(&self, outcome: Outcome, test: &str, message: impl Into<String>) {
        let record = OutcomeRecord::new(outcome, test, message);
        self.counts.lock().unwrap_or_else(|e| e.into_inner()).add(outcome);
        self.reporter.record(&record);
    }

    pub fn ok(&self, test: &str, message: impl Into<String>) {
        self.report(Outcome::Ok, test, message);
    }

    pub fn info(&self, test: &str, message: impl Into<String>) {
        self.report(Outcome::Info, test, message);
    }

    pub fn issue(&self, test: &str, message: impl Into<String>) {
        self.report(Outcome::Issue, test, message);
    }

    pub fn error(&self, test: &str, message: impl Into<String>) {
        self.report(Outcome::Error, test, message);
    }

    pub fn trace(&self, test: &str, message: &str) {
        self.reporter.trace(test, message);
    }

    pub fn alert(&self, message: &str) {
        self.reporter.configuration_alert(message);
    }

    pub fn report_verdict(&self, test: &str, verdict: Verdict) {
        self.report(verdict.outcome, test, verdict.message);
        if let Some(detail) = verdict.detail {
            self.info(test, detail);
        }
    }

    /// Ok when `pass`, Issue otherwise
    pub fn assert(&self, test: &str, pass: bool, message: impl Into<String>) {
        let outcome = if pass { Outcome::Ok } else { Outcome::Issue };
        self.report(outcome, test, message);
    }

    // -------------------------------------------------------------------------
    // Device calls
    // -------------------------------------------------------------------------

    /// Make one device call after checking for cancellation
    pub async fn call<T, F>(&self, member: &str, call: F) -> ConformResult<DeviceResult<T>>
    where
        F: Future<Output = DeviceResult<T>>,
    {
        self.check_cancelled()?;
        self.trace(member, "About to call");
        Ok(call.await)
    }

    /// Call a member and classify any error against `requirement`.
    ///
    /// Returns the value when the call succeeded and was allowed to; the
    /// caller then validates it and reports the result.
    pub async fn check<T, F>(&self, member: &str, requirement: Requirement, call: F) -> ConformResult<Option<T>>
    where
        F: Future<Output = DeviceResult<T>>,
    {
        match self.call(member, call).await? {
            Ok(value) => match classify::classify_success(member, requirement) {
                Some(verdict) => {
                    self.report_verdict(member, verdict);
                    Ok(None)
                }
                None => Ok(Some(value)),
            },
            Err(error) => {
                self.report_verdict(member, classify::classify_error(member, &error, requirement));
                Ok(None)
            }
        }
    }

    /// Call a method and classify the outcome; true when it ran as required
    pub async fn invoke<F>(&self, member: &str, requirement: Requirement, call: F) -> ConformResult<bool>
    where
        F: Future<Output = DeviceResult<()>>,
    {
        match self.call(member, call).await? {
            Ok(()) => match classify::classify_success(member, requirement) {
                Some(verdict) => {
                    self.report_verdict(member, verdict);
                    Ok(false)
                }
                None => Ok(true),
            },
            Err(error) => {
                self.report_verdict(member, classify::classify_error(member, &error, requirement));
                Ok(false)
            }
        }
    }

    /// Call a member the current step cannot continue without
    pub async fn require<T, F>(&self, member: &str, call: F) -> ConformResult<T>
    where
        F: Future<Output = DeviceResult<T>>,
    {
        self.call(member, call).await?.map_err(|e| ConformError::device(member, e))
    }

    /// Write TargetRightAscension and TargetDeclination; a refused write is only traced
    pub async fn preset_target(&self, ra: f64, dec: f64) -> ConformResult<()> {
        let device = self.device;
        if let Err(error) = self
            .call("TargetRightAscension", device.set_target_right_ascension(ra))
            .await?
        {
            self.trace("TargetRightAscension", &format!("Write of {:.6} refused: {}", ra, error));
        }
        if let Err(error) = self.call("TargetDeclination", device.set_target_declination(dec)).await? {
            self.trace("TargetDeclination", &format!("Write of {:.6} refused: {}", dec, error));
        }
        Ok(())
    }

    /// Send an out-of-range value and expect InvalidValue
    pub async fn expect_invalid<F>(
        &self,
        member: &str,
        attempted: &str,
        requirement: Requirement,
        call: F,
    ) -> ConformResult<()>
    where
        F: Future<Output = DeviceResult<()>>,
    {
        let result = self.call(member, call).await?;
        let verdict = classify::classify_invalid_value(member, attempted, result.as_ref().map(|_| ()), requirement);
        self.report_verdict(member, verdict);
        Ok(())
    }

    /// Call a motion member while parked and expect a parked rejection
    pub async fn expect_parked<F>(&self, member: &str, profile: &InterfaceProfile, call: F) -> ConformResult<bool>
    where
        F: Future<Output = DeviceResult<()>>,
    {
        let result = self.call(member, call).await?;
        let moved = result.is_ok();
        let verdict = classify::classify_parked(member, profile, result.as_ref().map(|_| ()));
        self.report_verdict(&format!("Parked:{}", member), verdict);
        Ok(moved)
    }

    // -------------------------------------------------------------------------
    // Waiting
    // -------------------------------------------------------------------------

    /// Wait for `busy` to clear using the configured poll interval.
    ///
    /// Cancellation is checked again as soon as the waiter returns.
    pub async fn wait_while<F, Fut>(
        &self,
        operation: &str,
        busy: F,
        minimum: Duration,
        timeout: Duration,
    ) -> ConformResult<Duration>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DeviceResult<bool>>,
    {
        let outcome =
            waiter::wait_while_min(operation, busy, minimum, self.settings.poll_interval(), timeout, &self.cancel)
                .await?;
        self.check_cancelled()?;
        match outcome {
            WaitOutcome::Completed(elapsed) => Ok(elapsed),
            WaitOutcome::Cancelled => Err(ConformError::Cancelled),
        }
    }

    /// Wait for the mount to stop slewing
    pub async fn wait_for_slew(&self, operation: &str, minimum: Duration) -> ConformResult<Duration> {
        let device = self.device;
        self.wait_while(operation, || device.slewing(), minimum, self.settings.maximum_slew_time())
            .await
    }

    pub async fn pause(&self, duration: Duration) -> ConformResult<Duration> {
        let outcome = waiter::pause(duration, &self.cancel).await;
        self.check_cancelled()?;
        match outcome {
            WaitOutcome::Completed(elapsed) => Ok(elapsed),
            WaitOutcome::Cancelled => Err(ConformError::Cancelled),
        }
    }

    // -------------------------------------------------------------------------
    // Isolation
    // -------------------------------------------------------------------------

    /// Run one test step so that its failure cannot stop the run.
    ///
    /// Timeouts and uncaught device errors become Issues, engine errors and
    /// panics become Errors. Only cancellation propagates.
    pub async fn run_step<F>(&self, test: &str, step: F) -> ConformResult<()>
    where
        F: Future<Output = ConformResult<()>>,
    {
        match AssertUnwindSafe(step).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(ConformError::Cancelled)) => Err(ConformError::Cancelled),
            Ok(Err(e @ ConformError::Timeout { .. })) => {
                self.issue(test, e.to_string());
                Ok(())
            }
            Ok(Err(ConformError::Device { member, source })) => {
                self.issue(test, format!("Test abandoned, {} raised {}", member, source));
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!("{} failed inside the engine: {}", test, e);
                self.error(test, e.to_string());
                Ok(())
            }
            Err(payload) => {
                let message = extract_panic_message(&payload);
                tracing::error!("Panic caught in {}: {}", test, message);
                self.error(test, format!("Internal panic: {}", message));
                Ok(())
            }
        }
    }
}

fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, ErrorKind};
    use crate::report::RecordingReporter;
    use crate::simulator::{SimulatedTelescope, SimulatorConfig};

    fn fixture() -> (SimulatedTelescope, TelescopeSettings, RecordingReporter) {
        (
            SimulatedTelescope::default(),
            TelescopeSettings::fast_for_tests(),
            RecordingReporter::new(),
        )
    }

    #[tokio::test]
    async fn test_check_reports_mandatory_failure() {
        let (device, settings, reporter) = fixture();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));

        let value: Option<f64> = session
            .check("Altitude", Requirement::Mandatory, async {
                Err(DeviceError::new(ErrorKind::Other, "boom"))
            })
            .await
            .unwrap();

        assert!(value.is_none());
        assert!(reporter.has("Altitude", Outcome::Issue));
        assert_eq!(session.counts().issues, 1);
    }

    #[tokio::test]
    async fn test_invoke_success_under_must_not_is_issue() {
        let (device, settings, reporter) = fixture();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));

        let ran = session
            .invoke("FindHome", Requirement::MustNotBeImplemented("CanFindHome"), async { Ok(()) })
            .await
            .unwrap();

        assert!(!ran);
        assert_eq!(reporter.outcomes("FindHome"), vec![Outcome::Issue]);
    }

    #[tokio::test]
    async fn test_refused_target_write_is_traced() {
        let mut config = SimulatorConfig::default();
        config.faults.failing_members.push("TargetDeclination".to_string());
        let device = SimulatedTelescope::new(config);
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));

        session.preset_target(12.0, 30.0).await.unwrap();

        let traces = reporter.traces();
        assert!(traces.iter().any(|(test, message)| {
            test == "TargetDeclination" && message.starts_with("Write of 30.000000 refused")
        }));
        assert!(!traces.iter().any(|(_, message)| message.contains("12.000000 refused")));
        assert_eq!(device.target_right_ascension().await.unwrap(), 12.0);
        assert!(reporter.records().is_empty());
    }

    #[tokio::test]
    async fn test_calls_refuse_to_start_when_cancelled() {
        let (device, settings, reporter) = fixture();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(true)));

        let result = session.check("Altitude", Requirement::Mandatory, device.altitude()).await;
        assert!(matches!(result, Err(ConformError::Cancelled)));
        assert!(reporter.records().is_empty());
    }

    #[tokio::test]
    async fn test_run_step_isolates_failures() {
        let (device, settings, reporter) = fixture();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));

        session
            .run_step("Timeout", async { Err(ConformError::timeout("Park", 1.0)) })
            .await
            .unwrap();
        session
            .run_step("Internal", async { Err(ConformError::Internal("bad state".to_string())) })
            .await
            .unwrap();
        session
            .run_step("Device", async {
                Err(ConformError::device("Slewing", DeviceError::new(ErrorKind::Other, "gone")))
            })
            .await
            .unwrap();

        assert_eq!(reporter.outcomes("Timeout"), vec![Outcome::Issue]);
        assert_eq!(reporter.outcomes("Internal"), vec![Outcome::Error]);
        assert_eq!(reporter.outcomes("Device"), vec![Outcome::Issue]);
    }

    #[tokio::test]
    async fn test_run_step_catches_panics() {
        let (device, settings, reporter) = fixture();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));

        let result = session
            .run_step("Panicky", async {
                let values: Vec<f64> = Vec::new();
                if values.is_empty() {
                    panic!("no values");
                }
                Ok(())
            })
            .await;

        assert!(result.is_ok());
        let records = reporter.for_test("Panicky");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Error);
        assert!(records[0].message.contains("no values"));
    }

    #[tokio::test]
    async fn test_run_step_propagates_cancellation() {
        let (device, settings, reporter) = fixture();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));

        let result = session.run_step("Cancelled", async { Err(ConformError::Cancelled) }).await;
        assert!(matches!(result, Err(ConformError::Cancelled)));
        assert!(reporter.records().is_empty());
    }

    #[tokio::test]
    async fn test_expect_invalid_reports_acceptance() {
        let (device, settings, reporter) = fixture();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));

        session
            .expect_invalid("SiteLatitude Write", "-91", Requirement::Mandatory, async { Ok(()) })
            .await
            .unwrap();
        session
            .expect_invalid("SiteLatitude Write", "91", Requirement::Mandatory, async {
                Err(DeviceError::invalid_value("too high"))
            })
            .await
            .unwrap();

        assert_eq!(reporter.outcomes("SiteLatitude Write"), vec![Outcome::Issue, Outcome::Ok]);
    }
}
