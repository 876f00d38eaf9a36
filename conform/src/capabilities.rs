//! Capability registry
//!
//! Capability flags are read once, at the start of a run, and decide what
//! every later test expects. A flag cannot change after it has been recorded.

use crate::classify::Requirement;
use crate::device::{DeviceResult, TelescopeAxis, Telescope};
use crate::error::ConformResult;
use crate::session::{RunContext, TestSession};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    CanFindHome,
    CanPark,
    CanPulseGuide,
    CanSetDeclinationRate,
    CanSetGuideRates,
    CanSetPark,
    CanSetPierSide,
    CanSetRightAscensionRate,
    CanSetTracking,
    CanSlew,
    CanSlewAltAz,
    CanSlewAltAzAsync,
    CanSlewAsync,
    CanSync,
    CanSyncAltAz,
    CanUnpark,
}

impl Capability {
    pub const ALL: [Capability; 16] = [
        Capability::CanFindHome,
        Capability::CanPark,
        Capability::CanPulseGuide,
        Capability::CanSetDeclinationRate,
        Capability::CanSetGuideRates,
        Capability::CanSetPark,
        Capability::CanSetPierSide,
        Capability::CanSetRightAscensionRate,
        Capability::CanSetTracking,
        Capability::CanSlew,
        Capability::CanSlewAltAz,
        Capability::CanSlewAltAzAsync,
        Capability::CanSlewAsync,
        Capability::CanSync,
        Capability::CanSyncAltAz,
        Capability::CanUnpark,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Capability::CanFindHome => "CanFindHome",
            Capability::CanPark => "CanPark",
            Capability::CanPulseGuide => "CanPulseGuide",
            Capability::CanSetDeclinationRate => "CanSetDeclinationRate",
            Capability::CanSetGuideRates => "CanSetGuideRates",
            Capability::CanSetPark => "CanSetPark",
            Capability::CanSetPierSide => "CanSetPierSide",
            Capability::CanSetRightAscensionRate => "CanSetRightAscensionRate",
            Capability::CanSetTracking => "CanSetTracking",
            Capability::CanSlew => "CanSlew",
            Capability::CanSlewAltAz => "CanSlewAltAz",
            Capability::CanSlewAltAzAsync => "CanSlewAltAzAsync",
            Capability::CanSlewAsync => "CanSlewAsync",
            Capability::CanSync => "CanSync",
            Capability::CanSyncAltAz => "CanSyncAltAz",
            Capability::CanUnpark => "CanUnpark",
        }
    }

    /// Read this flag from the device
    pub async fn read(&self, device: &dyn Telescope) -> DeviceResult<bool> {
        match self {
            Capability::CanFindHome => device.can_find_home().await,
            Capability::CanPark => device.can_park().await,
            Capability::CanPulseGuide => device.can_pulse_guide().await,
            Capability::CanSetDeclinationRate => device.can_set_declination_rate().await,
            Capability::CanSetGuideRates => device.can_set_guide_rates().await,
            Capability::CanSetPark => device.can_set_park().await,
            Capability::CanSetPierSide => device.can_set_pier_side().await,
            Capability::CanSetRightAscensionRate => device.can_set_right_ascension_rate().await,
            Capability::CanSetTracking => device.can_set_tracking().await,
            Capability::CanSlew => device.can_slew().await,
            Capability::CanSlewAltAz => device.can_slew_alt_az().await,
            Capability::CanSlewAltAzAsync => device.can_slew_alt_az_async().await,
            Capability::CanSlewAsync => device.can_slew_async().await,
            Capability::CanSync => device.can_sync().await,
            Capability::CanSyncAltAz => device.can_sync_alt_az().await,
            Capability::CanUnpark => device.can_unpark().await,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Name used when reporting CanMoveAxis for an axis
pub fn can_move_axis_name(axis: TelescopeAxis) -> &'static str {
    match axis {
        TelescopeAxis::Primary => "CanMoveAxis(Primary)",
        TelescopeAxis::Secondary => "CanMoveAxis(Secondary)",
        TelescopeAxis::Tertiary => "CanMoveAxis(Tertiary)",
    }
}

/// Write-once capability store
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    flags: HashMap<Capability, bool>,
    can_move_axis: [Option<bool>; 3],
    side_of_pier_readable: Option<bool>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a flag. Returns false, leaving the first value in place, when the
    /// flag was already recorded.
    pub fn set(&mut self, capability: Capability, value: bool) -> bool {
        if let Some(existing) = self.flags.get(&capability) {
            tracing::warn!(
                "Ignoring attempt to change {} from {} to {} after discovery",
                capability,
                existing,
                value
            );
            return false;
        }
        self.flags.insert(capability, value);
        true
    }

    /// Flag value; unknown flags read as false
    pub fn get(&self, capability: Capability) -> bool {
        self.flags.get(&capability).copied().unwrap_or(false)
    }

    pub fn is_known(&self, capability: Capability) -> bool {
        self.flags.contains_key(&capability)
    }

    pub fn set_can_move_axis(&mut self, axis: TelescopeAxis, value: bool) -> bool {
        let slot = &mut self.can_move_axis[axis.index()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        true
    }

    pub fn can_move_axis(&self, axis: TelescopeAxis) -> bool {
        self.can_move_axis[axis.index()].unwrap_or(false)
    }

    /// Unknown until the first SideOfPier read
    pub fn side_of_pier_readable(&self) -> Option<bool> {
        self.side_of_pier_readable
    }

    pub fn set_side_of_pier_readable(&mut self, readable: bool) -> bool {
        if self.side_of_pier_readable.is_some() {
            return false;
        }
        self.side_of_pier_readable = Some(readable);
        true
    }

    /// Requirement for a member gated by `capability`
    pub fn requirement(&self, capability: Capability) -> Requirement {
        Requirement::from_capability(capability.name(), self.get(capability))
    }
}

/// Read every capability flag into the registry
pub async fn discover(session: &TestSession<'_>, ctx: &mut RunContext) -> ConformResult<()> {
    let requirement = Requirement::mandatory_if(ctx.profile.capability_getters_mandatory);

    for capability in Capability::ALL {
        let value = session
            .check(capability.name(), requirement, capability.read(session.device))
            .await?;

        match value {
            Some(value) => {
                session.ok(capability.name(), value.to_string());
                ctx.caps.set(capability, value);
            }
            None => {
                ctx.caps.set(capability, false);
            }
        }
    }

    check_pairing(session, ctx);
    Ok(())
}

/// Synchronous and asynchronous slew flags must agree where the interface requires it
pub fn check_pairing(session: &TestSession<'_>, ctx: &RunContext) {
    if !ctx.profile.slew_flags_must_pair {
        return;
    }

    let pairs = [
        (Capability::CanSlew, Capability::CanSlewAsync),
        (Capability::CanSlewAltAz, Capability::CanSlewAltAzAsync),
    ];

    for (sync, asynchronous) in pairs {
        let test = format!("{}/{}", sync, asynchronous);
        let (a, b) = (ctx.caps.get(sync), ctx.caps.get(asynchronous));
        if a == b {
            session.ok(&test, format!("{} and {} are both {}", sync, asynchronous, a));
        } else {
            session.issue(
                &test,
                format!(
                    "{} is {} but {} is {}, {} requires them to be the same",
                    sync, a, asynchronous, b, ctx.profile.generation
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelescopeSettings;
    use crate::interface::InterfaceProfile;
    use crate::report::{Outcome, RecordingReporter};
    use crate::simulator::{SimulatedTelescope, SimulatorConfig};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_flags_are_write_once() {
        let mut registry = CapabilityRegistry::new();
        assert!(!registry.get(Capability::CanPark));
        assert!(registry.set(Capability::CanPark, true));
        assert!(!registry.set(Capability::CanPark, false));
        assert!(registry.get(Capability::CanPark));
        assert!(registry.is_known(Capability::CanPark));
        assert!(!registry.is_known(Capability::CanSync));
    }

    #[test]
    fn test_axis_and_pier_flags_are_write_once() {
        let mut registry = CapabilityRegistry::new();
        assert!(registry.set_can_move_axis(TelescopeAxis::Secondary, true));
        assert!(!registry.set_can_move_axis(TelescopeAxis::Secondary, false));
        assert!(registry.can_move_axis(TelescopeAxis::Secondary));
        assert!(!registry.can_move_axis(TelescopeAxis::Tertiary));

        assert_eq!(registry.side_of_pier_readable(), None);
        assert!(registry.set_side_of_pier_readable(false));
        assert!(!registry.set_side_of_pier_readable(true));
        assert_eq!(registry.side_of_pier_readable(), Some(false));
    }

    #[test]
    fn test_requirement_follows_flag() {
        let mut registry = CapabilityRegistry::new();
        registry.set(Capability::CanSync, false);
        assert_eq!(registry.requirement(Capability::CanSync), Requirement::MustNotBeImplemented("CanSync"));
        registry.set(Capability::CanPark, true);
        assert_eq!(registry.requirement(Capability::CanPark), Requirement::MustBeImplemented("CanPark"));
    }

    #[tokio::test]
    async fn test_discover_reads_all_flags() {
        let device = SimulatedTelescope::default();
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let mut ctx = RunContext::new(InterfaceProfile::from_version(4));

        discover(&session, &mut ctx).await.unwrap();

        for capability in Capability::ALL {
            assert!(ctx.caps.is_known(capability));
            assert_eq!(reporter.outcomes(capability.name()), vec![Outcome::Ok]);
        }
        assert!(ctx.caps.get(Capability::CanSlewAsync));
        assert!(reporter.has("CanSlew/CanSlewAsync", Outcome::Ok));
    }

    #[tokio::test]
    async fn test_mismatched_slew_flags_are_an_issue_not_a_failure() {
        let mut config = SimulatorConfig::default();
        config.capabilities.can_slew_async = false;
        let device = SimulatedTelescope::new(config);
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let mut ctx = RunContext::new(InterfaceProfile::from_version(4));

        discover(&session, &mut ctx).await.unwrap();

        assert!(reporter.has("CanSlew/CanSlewAsync", Outcome::Issue));
        assert!(reporter.has("CanSlewAltAz/CanSlewAltAzAsync", Outcome::Ok));
    }

    #[tokio::test]
    async fn test_pairing_not_checked_before_v4() {
        let mut config = SimulatorConfig::default();
        config.capabilities.can_slew_async = false;
        let device = SimulatedTelescope::new(config);
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let mut ctx = RunContext::new(InterfaceProfile::from_version(3));

        discover(&session, &mut ctx).await.unwrap();

        assert!(reporter.for_test("CanSlew/CanSlewAsync").is_empty());
    }

    #[tokio::test]
    async fn test_failed_capability_read_defaults_to_false() {
        let mut config = SimulatorConfig::default();
        config.faults.failing_members.push("CanPark".to_string());
        let device = SimulatedTelescope::new(config);
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let mut ctx = RunContext::new(InterfaceProfile::from_version(4));

        discover(&session, &mut ctx).await.unwrap();

        assert!(!ctx.caps.get(Capability::CanPark));
        assert!(ctx.caps.is_known(Capability::CanPark));
        assert_eq!(reporter.outcomes("CanPark"), vec![Outcome::Issue]);
    }
}
