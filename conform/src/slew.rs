//! Slew and sync orchestration
//!
//! Every slew/sync variant goes through the same progression:
//!
//! ```text
//! Idle -> TargetComputed -> CommandIssued -> ImmediateComplete            (synchronous)
//!                                         -> Polling -> Complete | TimedOut (asynchronous)
//! ```
//!
//! A completed move is checked against its target within the slew tolerance,
//! then the variant is sent deliberately bad coordinates and must refuse them.

use crate::angles;
use crate::capabilities::Capability;
use crate::classify::Requirement;
use crate::config::MethodTests;
use crate::device::{DeviceResult, ErrorKind, Telescope};
use crate::error::{ConformError, ConformResult};
use crate::session::{RunContext, TestSession};
use crate::targets::{self, EquatorialTarget, HorizontalTarget};
use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;

/// Offset applied by the sync tests, hours of RA
const SYNC_OFFSET_HOURS: f64 = 1.0 / 60.0;

/// Offset applied by the sync tests, degrees
const SYNC_OFFSET_DEG: f64 = 0.25;

const BAD_RIGHT_ASCENSION: f64 = 25.0;
const BAD_DECLINATION: f64 = 100.0;
const BAD_ALTITUDE: f64 = 100.0;
const BAD_AZIMUTH: f64 = 400.0;

// =============================================================================
// KINDS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlewSyncKind {
    SlewToCoordinates,
    SlewToCoordinatesAsync,
    SlewToTarget,
    SlewToTargetAsync,
    SlewToAltAz,
    SlewToAltAzAsync,
    SyncToCoordinates,
    SyncToTarget,
    SyncToAltAz,
}

impl SlewSyncKind {
    pub const ALL: [SlewSyncKind; 9] = [
        SlewSyncKind::SlewToCoordinates,
        SlewSyncKind::SlewToCoordinatesAsync,
        SlewSyncKind::SlewToTarget,
        SlewSyncKind::SlewToTargetAsync,
        SlewSyncKind::SlewToAltAz,
        SlewSyncKind::SlewToAltAzAsync,
        SlewSyncKind::SyncToCoordinates,
        SlewSyncKind::SyncToTarget,
        SlewSyncKind::SyncToAltAz,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SlewSyncKind::SlewToCoordinates => "SlewToCoordinates",
            SlewSyncKind::SlewToCoordinatesAsync => "SlewToCoordinatesAsync",
            SlewSyncKind::SlewToTarget => "SlewToTarget",
            SlewSyncKind::SlewToTargetAsync => "SlewToTargetAsync",
            SlewSyncKind::SlewToAltAz => "SlewToAltAz",
            SlewSyncKind::SlewToAltAzAsync => "SlewToAltAzAsync",
            SlewSyncKind::SyncToCoordinates => "SyncToCoordinates",
            SlewSyncKind::SyncToTarget => "SyncToTarget",
            SlewSyncKind::SyncToAltAz => "SyncToAltAz",
        }
    }

    /// Capability that declares this variant
    pub fn capability(&self) -> Capability {
        match self {
            SlewSyncKind::SlewToCoordinates | SlewSyncKind::SlewToTarget => Capability::CanSlew,
            SlewSyncKind::SlewToCoordinatesAsync | SlewSyncKind::SlewToTargetAsync => Capability::CanSlewAsync,
            SlewSyncKind::SlewToAltAz => Capability::CanSlewAltAz,
            SlewSyncKind::SlewToAltAzAsync => Capability::CanSlewAltAzAsync,
            SlewSyncKind::SyncToCoordinates | SlewSyncKind::SyncToTarget => Capability::CanSync,
            SlewSyncKind::SyncToAltAz => Capability::CanSyncAltAz,
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(
            self,
            SlewSyncKind::SlewToCoordinatesAsync | SlewSyncKind::SlewToTargetAsync | SlewSyncKind::SlewToAltAzAsync
        )
    }

    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            SlewSyncKind::SyncToCoordinates | SlewSyncKind::SyncToTarget | SlewSyncKind::SyncToAltAz
        )
    }

    pub fn is_horizontal(&self) -> bool {
        matches!(
            self,
            SlewSyncKind::SlewToAltAz | SlewSyncKind::SlewToAltAzAsync | SlewSyncKind::SyncToAltAz
        )
    }

    pub fn uses_target(&self) -> bool {
        matches!(
            self,
            SlewSyncKind::SlewToTarget | SlewSyncKind::SlewToTargetAsync | SlewSyncKind::SyncToTarget
        )
    }

    pub fn enabled(&self, methods: &MethodTests) -> bool {
        match self {
            SlewSyncKind::SlewToCoordinates => methods.slew_to_coordinates,
            SlewSyncKind::SlewToCoordinatesAsync => methods.slew_to_coordinates_async,
            SlewSyncKind::SlewToTarget => methods.slew_to_target,
            SlewSyncKind::SlewToTargetAsync => methods.slew_to_target_async,
            SlewSyncKind::SlewToAltAz => methods.slew_to_alt_az,
            SlewSyncKind::SlewToAltAzAsync => methods.slew_to_alt_az_async,
            SlewSyncKind::SyncToCoordinates => methods.sync_to_coordinates,
            SlewSyncKind::SyncToTarget => methods.sync_to_target,
            SlewSyncKind::SyncToAltAz => methods.sync_to_alt_az,
        }
    }

    /// Hour angle of the equatorial slew target
    fn hour_angle(&self) -> f64 {
        match self {
            SlewSyncKind::SlewToCoordinates => 1.0,
            SlewSyncKind::SlewToCoordinatesAsync => 2.0,
            SlewSyncKind::SlewToTarget => 3.0,
            SlewSyncKind::SlewToTargetAsync => 4.0,
            _ => 1.0,
        }
    }

    /// Alt/az slew target
    fn horizontal_target(&self) -> HorizontalTarget {
        match self {
            SlewSyncKind::SlewToAltAzAsync => HorizontalTarget::new(55.0, 155.0),
            _ => HorizontalTarget::new(50.0, 150.0),
        }
    }
}

impl fmt::Display for SlewSyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlewPhase {
    Idle,
    TargetComputed,
    CommandIssued,
    ImmediateComplete,
    Polling,
    Complete,
    TimedOut,
}

struct PhaseTracker {
    kind: SlewSyncKind,
    phase: SlewPhase,
}

impl PhaseTracker {
    fn new(kind: SlewSyncKind) -> Self {
        Self {
            kind,
            phase: SlewPhase::Idle,
        }
    }

    fn enter(&mut self, next: SlewPhase) {
        tracing::debug!("{}: {:?} -> {:?}", self.kind, self.phase, next);
        self.phase = next;
    }
}

/// Where a slew or sync is sent
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlewTarget {
    Equatorial(EquatorialTarget),
    Horizontal(HorizontalTarget),
}

impl fmt::Display for SlewTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlewTarget::Equatorial(t) => write!(f, "{}", t),
            SlewTarget::Horizontal(t) => write!(f, "{}", t),
        }
    }
}

/// The device call for `kind`. ToTarget variants ignore the coordinates.
pub fn command<'a>(kind: SlewSyncKind, device: &'a dyn Telescope, a: f64, b: f64) -> BoxFuture<'a, DeviceResult<()>> {
    match kind {
        SlewSyncKind::SlewToCoordinates => device.slew_to_coordinates(a, b),
        SlewSyncKind::SlewToCoordinatesAsync => device.slew_to_coordinates_async(a, b),
        SlewSyncKind::SlewToTarget => device.slew_to_target(),
        SlewSyncKind::SlewToTargetAsync => device.slew_to_target_async(),
        SlewSyncKind::SlewToAltAz => device.slew_to_alt_az(a, b),
        SlewSyncKind::SlewToAltAzAsync => device.slew_to_alt_az_async(a, b),
        SlewSyncKind::SyncToCoordinates => device.sync_to_coordinates(a, b),
        SlewSyncKind::SyncToTarget => device.sync_to_target(),
        SlewSyncKind::SyncToAltAz => device.sync_to_alt_az(a, b),
    }
}

// =============================================================================
// SHARED MOUNT HELPERS
// =============================================================================

/// Put tracking into the requested state. False when the device cannot.
pub async fn ensure_tracking(session: &TestSession<'_>, ctx: &RunContext, enabled: bool) -> ConformResult<bool> {
    let device = session.device;
    let current = session.require("Tracking", device.tracking()).await?;
    if current == enabled {
        return Ok(true);
    }
    if !ctx.caps.get(Capability::CanSetTracking) {
        return Ok(false);
    }
    session.require("Tracking", device.set_tracking(enabled)).await?;
    Ok(true)
}

/// Site latitude from the snapshot, or read fresh
pub async fn site_latitude(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<f64> {
    match ctx.snapshot.site_latitude {
        Some(latitude) => Ok(latitude),
        None => session.require("SiteLatitude", session.device.site_latitude()).await,
    }
}

/// Best effort AbortSlew
pub async fn abort_quietly(session: &TestSession<'_>) -> ConformResult<()> {
    if let Err(error) = session.call("AbortSlew", session.device.abort_slew()).await? {
        session.trace("AbortSlew", &format!("AbortSlew raised {}", error));
    }
    Ok(())
}

/// Slew to an equatorial target with whichever slew the device supports.
///
/// Returns None, without reporting, when the mount has no usable slew or
/// tracking cannot be enabled.
pub async fn slew_to(
    session: &TestSession<'_>,
    ctx: &RunContext,
    operation: &str,
    target: EquatorialTarget,
) -> ConformResult<Option<EquatorialTarget>> {
    if !ensure_tracking(session, ctx, true).await? {
        return Ok(None);
    }
    let device = session.device;
    if ctx.caps.get(Capability::CanSlew) {
        session
            .require("SlewToCoordinates", device.slew_to_coordinates(target.ra, target.dec))
            .await?;
        session.wait_for_slew(operation, Duration::ZERO).await?;
    } else if ctx.caps.get(Capability::CanSlewAsync) {
        session
            .require("SlewToCoordinatesAsync", device.slew_to_coordinates_async(target.ra, target.dec))
            .await?;
        session
            .wait_for_slew(operation, session.settings.slew_minimum_duration())
            .await?;
    } else {
        return Ok(None);
    }
    Ok(Some(target))
}

/// Slew to `hour_angle` at `dec`, computing RA from the current sidereal time
pub async fn slew_to_hour_angle(
    session: &TestSession<'_>,
    ctx: &RunContext,
    operation: &str,
    hour_angle: f64,
    dec: f64,
) -> ConformResult<Option<EquatorialTarget>> {
    let lst = session.require("SiderealTime", session.device.sidereal_time()).await?;
    slew_to(session, ctx, operation, EquatorialTarget::at_hour_angle(lst, hour_angle, dec)).await
}

// =============================================================================
// ORCHESTRATION
// =============================================================================

/// Run every enabled slew and sync variant
pub async fn check_slews(session: &TestSession<'_>, ctx: &mut RunContext) -> ConformResult<()> {
    tracing::info!("Checking slew and sync methods");
    for kind in SlewSyncKind::ALL {
        if !kind.enabled(&session.settings.methods) {
            continue;
        }
        session.run_step(kind.name(), run_slew_sync(kind, session, ctx)).await?;
    }
    Ok(())
}

pub async fn run_slew_sync(kind: SlewSyncKind, session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    let member = kind.name();
    let capability = kind.capability();
    let requirement = ctx.caps.requirement(capability);

    if !ctx.caps.get(capability) {
        return refused(kind, session, requirement).await;
    }

    if !ensure_tracking(session, ctx, !kind.is_horizontal()).await? {
        let state = if kind.is_horizontal() { "disabled" } else { "enabled" };
        session.info(member, format!("Skipped, tracking could not be {}", state));
        return Ok(());
    }

    let target = match compute_target(kind, session, ctx).await? {
        Some(target) => target,
        None => return Ok(()),
    };

    let original = if kind.is_sync() {
        Some(current_position(kind, session).await?)
    } else {
        None
    };

    execute(kind, session, ctx, target).await?;

    if let Some(original) = original {
        restore_sync(kind, session, original).await?;
    }

    bad_coordinates(kind, session, requirement).await
}

/// Capability is False: the call must refuse
async fn refused(kind: SlewSyncKind, session: &TestSession<'_>, requirement: Requirement) -> ConformResult<()> {
    let device = session.device;
    let (a, b) = if kind.is_horizontal() {
        (45.0, 180.0)
    } else {
        let lst = session.require("SiderealTime", device.sidereal_time()).await?;
        (angles::ra_at_hour_angle(lst, 1.0), 0.0)
    };

    if kind.uses_target() {
        // a missing target must not be the reason the call refuses
        session.preset_target(a, b).await?;
    }

    let moved = session.invoke(kind.name(), requirement, command(kind, device, a, b)).await;
    abort_quietly(session).await?;
    moved.map(|_| ())
}

async fn compute_target(
    kind: SlewSyncKind,
    session: &TestSession<'_>,
    ctx: &RunContext,
) -> ConformResult<Option<SlewTarget>> {
    let device = session.device;

    if kind.is_sync() {
        let position = current_position(kind, session).await?;
        return Ok(Some(match position {
            SlewTarget::Equatorial(p) => {
                let dec = if p.dec > 80.0 { p.dec - SYNC_OFFSET_DEG } else { p.dec + SYNC_OFFSET_DEG };
                SlewTarget::Equatorial(EquatorialTarget::new(p.ra + SYNC_OFFSET_HOURS, dec))
            }
            SlewTarget::Horizontal(p) => {
                let altitude = if p.altitude > 80.0 {
                    p.altitude - SYNC_OFFSET_DEG
                } else {
                    p.altitude + SYNC_OFFSET_DEG
                };
                SlewTarget::Horizontal(HorizontalTarget::new(altitude, p.azimuth + SYNC_OFFSET_DEG))
            }
        }));
    }

    if kind.is_horizontal() {
        return Ok(Some(SlewTarget::Horizontal(kind.horizontal_target())));
    }

    let lst = session.require("SiderealTime", device.sidereal_time()).await?;
    let latitude = site_latitude(session, ctx).await?;
    let ha = kind.hour_angle();
    let dec = targets::test_declination(ha, latitude);
    Ok(Some(SlewTarget::Equatorial(EquatorialTarget::at_hour_angle(lst, ha, dec))))
}

async fn current_position(kind: SlewSyncKind, session: &TestSession<'_>) -> ConformResult<SlewTarget> {
    let device = session.device;
    if kind.is_horizontal() {
        let altitude = session.require("Altitude", device.altitude()).await?;
        let azimuth = session.require("Azimuth", device.azimuth()).await?;
        Ok(SlewTarget::Horizontal(HorizontalTarget::new(altitude, azimuth)))
    } else {
        let ra = session.require("RightAscension", device.right_ascension()).await?;
        let dec = session.require("Declination", device.declination()).await?;
        Ok(SlewTarget::Equatorial(EquatorialTarget::new(ra, dec)))
    }
}

/// Issue `kind` towards `target`, wait for completion and verify the result
pub async fn execute(
    kind: SlewSyncKind,
    session: &TestSession<'_>,
    ctx: &RunContext,
    target: SlewTarget,
) -> ConformResult<()> {
    let member = kind.name();
    let device = session.device;
    let requirement = ctx.caps.requirement(kind.capability());
    let mut tracker = PhaseTracker::new(kind);

    tracker.enter(SlewPhase::TargetComputed);
    session.trace(member, &format!("Target {}", target));

    let (a, b) = match target {
        SlewTarget::Equatorial(t) => (t.ra, t.dec),
        SlewTarget::Horizontal(t) => (t.altitude, t.azimuth),
    };

    if kind.uses_target() {
        let target_requirement = Requirement::MustBeImplemented(kind.capability().name());
        if !session
            .invoke("TargetRightAscension Write", target_requirement, device.set_target_right_ascension(a))
            .await?
            || !session
                .invoke("TargetDeclination Write", target_requirement, device.set_target_declination(b))
                .await?
        {
            return Ok(());
        }
    }

    tracker.enter(SlewPhase::CommandIssued);
    if !session.invoke(member, requirement, command(kind, device, a, b)).await? {
        return Ok(());
    }

    if kind.is_async() {
        let slewing = session.require("Slewing", device.slewing()).await?;
        if slewing {
            session.ok(member, format!("Slewing is True immediately after {} returned", member));
        } else {
            session.issue(
                member,
                format!(
                    "Slewing is False immediately after {} returned, it must stay True until the slew completes",
                    member
                ),
            );
        }

        tracker.enter(SlewPhase::Polling);
        match session.wait_for_slew(member, session.settings.slew_minimum_duration()).await {
            Ok(elapsed) => {
                tracker.enter(SlewPhase::Complete);
                session.trace(member, &format!("Completed in {:.1}s", elapsed.as_secs_f64()));
            }
            Err(error @ ConformError::Timeout { .. }) => {
                tracker.enter(SlewPhase::TimedOut);
                abort_quietly(session).await?;
                return Err(error);
            }
            Err(error) => return Err(error),
        }
    } else {
        tracker.enter(SlewPhase::ImmediateComplete);
        if session.require("Slewing", device.slewing()).await? {
            session.issue(member, format!("Slewing is True after the synchronous {} returned", member));
            session.wait_for_slew(member, Duration::ZERO).await?;
        }
    }

    verify_position(kind, session, target).await
}

async fn verify_position(kind: SlewSyncKind, session: &TestSession<'_>, target: SlewTarget) -> ConformResult<()> {
    let member = kind.name();
    let device = session.device;
    let tolerance = session.settings.slew_tolerance_arcsec;
    let verb = if kind.is_sync() { "Synced" } else { "Slewed" };

    match target {
        SlewTarget::Equatorial(t) => {
            let ra = session.require("RightAscension", device.right_ascension()).await?;
            let dec = session.require("Declination", device.declination()).await?;
            let ra_error = angles::ra_difference_arcsec(ra, t.ra).abs();
            let dec_error = angles::degrees_difference_arcsec(dec, t.dec).abs();
            if ra_error <= tolerance && dec_error <= tolerance {
                session.ok(
                    member,
                    format!("{} to within {:.1}\" RA and {:.1}\" Dec of {}", verb, ra_error, dec_error, t),
                );
            } else {
                session.issue(
                    member,
                    format!(
                        "{} to RA {} Dec {}, which is {:.1}\" RA and {:.1}\" Dec from {} (tolerance {:.1}\")",
                        verb,
                        angles::format_hms(ra),
                        angles::format_dms(dec),
                        ra_error,
                        dec_error,
                        t,
                        tolerance
                    ),
                );
            }
            verify_targets_persisted(kind, session, t).await
        }
        SlewTarget::Horizontal(t) => {
            let altitude = session.require("Altitude", device.altitude()).await?;
            let azimuth = session.require("Azimuth", device.azimuth()).await?;
            let alt_error = angles::degrees_difference_arcsec(altitude, t.altitude).abs();
            let az_error = angles::azimuth_difference_arcsec(azimuth, t.azimuth).abs();
            if alt_error <= tolerance && az_error <= tolerance {
                session.ok(
                    member,
                    format!("{} to within {:.1}\" Alt and {:.1}\" Az of {}", verb, alt_error, az_error, t),
                );
            } else {
                session.issue(
                    member,
                    format!(
                        "{} to Alt {} Az {}, which is {:.1}\" Alt and {:.1}\" Az from {} (tolerance {:.1}\")",
                        verb,
                        angles::format_dms(altitude),
                        angles::format_dms(azimuth),
                        alt_error,
                        az_error,
                        t,
                        tolerance
                    ),
                );
            }
            Ok(())
        }
    }
}

/// Equatorial slews and syncs leave the target properties set to where they went
async fn verify_targets_persisted(
    kind: SlewSyncKind,
    session: &TestSession<'_>,
    target: EquatorialTarget,
) -> ConformResult<()> {
    let device = session.device;
    let tolerance = session.settings.slew_tolerance_arcsec;
    let member = kind.name();

    match session.call("TargetRightAscension", device.target_right_ascension()).await? {
        Ok(ra) => session.assert(
            member,
            angles::ra_difference_arcsec(ra, target.ra).abs() <= tolerance,
            format!("TargetRightAscension is {} after {}", angles::format_hms(ra), member),
        ),
        Err(error) => {
            session.issue(member, format!("TargetRightAscension could not be read after {}: {}", member, error))
        }
    }
    match session.call("TargetDeclination", device.target_declination()).await? {
        Ok(dec) => session.assert(
            member,
            angles::degrees_difference_arcsec(dec, target.dec).abs() <= tolerance,
            format!("TargetDeclination is {} after {}", angles::format_dms(dec), member),
        ),
        Err(error) => session.issue(member, format!("TargetDeclination could not be read after {}: {}", member, error)),
    }
    Ok(())
}

/// Sync back to where the mount was before the sync test
async fn restore_sync(kind: SlewSyncKind, session: &TestSession<'_>, original: SlewTarget) -> ConformResult<()> {
    let device = session.device;
    let result = match (kind, original) {
        (SlewSyncKind::SyncToAltAz, SlewTarget::Horizontal(p)) => {
            session.call("SyncToAltAz", device.sync_to_alt_az(p.altitude, p.azimuth)).await?
        }
        (_, SlewTarget::Equatorial(p)) => {
            session
                .call("SyncToCoordinates", device.sync_to_coordinates(p.ra, p.dec))
                .await?
        }
        _ => Ok(()),
    };
    if let Err(error) = result {
        session.issue(kind.name(), format!("Unable to sync back to {}: {}", original, error));
    }
    Ok(())
}

/// Out-of-range coordinates must be refused with InvalidValue
async fn bad_coordinates(kind: SlewSyncKind, session: &TestSession<'_>, requirement: Requirement) -> ConformResult<()> {
    let device = session.device;
    let member = kind.name();

    if kind.uses_target() {
        let probes = [
            ("Bad TargetRightAscension", BAD_RIGHT_ASCENSION, true),
            ("Bad TargetDeclination", BAD_DECLINATION, false),
        ];
        for (label, value, is_ra) in probes {
            let test = format!("{} ({})", member, label);
            let write = if is_ra {
                device.set_target_right_ascension(value)
            } else {
                device.set_target_declination(value)
            };
            match session.call(&test, write).await? {
                Err(error) if error.is(ErrorKind::InvalidValue) => {
                    session.ok(&test, format!("Setting {} was rejected with InvalidValue", value));
                }
                Err(error) => session.issue(
                    &test,
                    format!("Setting {} was rejected with {} instead of InvalidValue", value, error.kind),
                ),
                Ok(()) => {
                    session
                        .expect_invalid(&test, &value.to_string(), requirement, command(kind, device, 0.0, 0.0))
                        .await?;
                }
            }
            abort_quietly(session).await?;
        }
        return Ok(());
    }

    let probes = if kind.is_horizontal() {
        [
            ("Bad Altitude", BAD_ALTITUDE, 150.0),
            ("Bad Azimuth", 45.0, BAD_AZIMUTH),
        ]
    } else {
        [
            ("Bad RightAscension", BAD_RIGHT_ASCENSION, 0.0),
            ("Bad Declination", 12.0, BAD_DECLINATION),
        ]
    };

    for (label, a, b) in probes {
        let test = format!("{} ({})", member, label);
        session
            .expect_invalid(&test, &format!("{}, {}", a, b), requirement, command(kind, device, a, b))
            .await?;
        abort_quietly(session).await?;
    }
    Ok(())
}
