//! Method checks
//!
//! Optional methods are called when their capability says they exist and
//! must then do what they claim; when the capability says they do not exist
//! they must refuse. Park additionally fences every motion method.

use crate::angles;
use crate::capabilities::{self, Capability};
use crate::classify::Requirement;
use crate::config::MethodTests;
use crate::device::{DeviceResult, GuideDirection, PierSide, Telescope, TelescopeAxis};
use crate::error::ConformResult;
use crate::session::{RunContext, TestSession};
use crate::slew::{self, SlewSyncKind};
use crate::targets;
use futures::future::BoxFuture;
use std::time::{Duration, Instant};

/// A pulse that returns after this fraction of its length counts as synchronous
const SYNCHRONOUS_PULSE_FRACTION: f64 = 0.75;

/// Hour angles used for the DestinationSideOfPier prediction
const DESTINATION_HOUR_ANGLES: [f64; 2] = [-3.0, 3.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodCheck {
    CanMoveAxis,
    ParkUnpark,
    AbortSlew,
    AxisRates,
    FindHome,
    MoveAxis,
    PulseGuide,
    SetPark,
    SideOfPierWrite,
    DestinationSideOfPier,
}

impl MethodCheck {
    pub const ALL: [MethodCheck; 10] = [
        MethodCheck::CanMoveAxis,
        MethodCheck::ParkUnpark,
        MethodCheck::AbortSlew,
        MethodCheck::AxisRates,
        MethodCheck::FindHome,
        MethodCheck::MoveAxis,
        MethodCheck::PulseGuide,
        MethodCheck::SetPark,
        MethodCheck::SideOfPierWrite,
        MethodCheck::DestinationSideOfPier,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MethodCheck::CanMoveAxis => "CanMoveAxis",
            MethodCheck::ParkUnpark => "Park/Unpark",
            MethodCheck::AbortSlew => "AbortSlew",
            MethodCheck::AxisRates => "AxisRates",
            MethodCheck::FindHome => "FindHome",
            MethodCheck::MoveAxis => "MoveAxis",
            MethodCheck::PulseGuide => "PulseGuide",
            MethodCheck::SetPark => "SetPark",
            MethodCheck::SideOfPierWrite => "SideOfPier Write",
            MethodCheck::DestinationSideOfPier => "DestinationSideOfPier",
        }
    }

    pub fn enabled(&self, methods: &MethodTests) -> bool {
        match self {
            MethodCheck::CanMoveAxis => methods.can_move_axis,
            MethodCheck::ParkUnpark | MethodCheck::SetPark => methods.park_unpark,
            MethodCheck::AbortSlew => methods.abort_slew,
            MethodCheck::AxisRates => methods.axis_rates,
            MethodCheck::FindHome => methods.find_home,
            MethodCheck::MoveAxis => methods.move_axis,
            MethodCheck::PulseGuide => methods.pulse_guide,
            MethodCheck::SideOfPierWrite => methods.side_of_pier_write,
            MethodCheck::DestinationSideOfPier => methods.destination_side_of_pier,
        }
    }
}

/// Run every enabled method check in order
pub async fn check_methods(session: &TestSession<'_>, ctx: &mut RunContext) -> ConformResult<()> {
    tracing::info!("Checking methods");

    // MoveAxis and AxisRates depend on CanMoveAxis even when its own check is off
    if ctx.profile.has_axis_members && !session.settings.methods.can_move_axis {
        read_can_move_axis(session, ctx, false).await?;
    }

    for check in MethodCheck::ALL {
        if !check.enabled(&session.settings.methods) {
            continue;
        }
        session.run_step(check.name(), run_method(check, session, ctx)).await?;
    }
    Ok(())
}

pub async fn run_method(check: MethodCheck, session: &TestSession<'_>, ctx: &mut RunContext) -> ConformResult<()> {
    let axis_member = matches!(
        check,
        MethodCheck::CanMoveAxis | MethodCheck::AxisRates | MethodCheck::MoveAxis
    );
    if (axis_member && !ctx.profile.has_axis_members)
        || (check == MethodCheck::DestinationSideOfPier && !ctx.profile.has_destination_side_of_pier)
    {
        session.info(check.name(), format!("Not part of {}", ctx.profile.generation));
        return Ok(());
    }

    match check {
        MethodCheck::CanMoveAxis => read_can_move_axis(session, ctx, true).await,
        MethodCheck::ParkUnpark => park_and_unpark(session, ctx).await,
        MethodCheck::AbortSlew => abort_slew(session, ctx).await,
        MethodCheck::AxisRates => axis_rates(session, ctx).await,
        MethodCheck::FindHome => find_home(session, ctx).await,
        MethodCheck::MoveAxis => move_axis(session, ctx).await,
        MethodCheck::PulseGuide => pulse_guide(session, ctx).await,
        MethodCheck::SetPark => set_park(session, ctx).await,
        MethodCheck::SideOfPierWrite => side_of_pier_write(session, ctx).await,
        MethodCheck::DestinationSideOfPier => destination_side_of_pier(session, ctx).await,
    }
}

async fn read_can_move_axis(session: &TestSession<'_>, ctx: &mut RunContext, report: bool) -> ConformResult<()> {
    let requirement = Requirement::mandatory_if(ctx.profile.capability_getters_mandatory);
    for axis in TelescopeAxis::ALL {
        let name = capabilities::can_move_axis_name(axis);
        let value = if report {
            session.check(name, requirement, session.device.can_move_axis(axis)).await?
        } else {
            session.call(name, session.device.can_move_axis(axis)).await?.ok()
        };
        if report {
            if let Some(value) = value {
                session.ok(name, value.to_string());
            }
        }
        ctx.caps.set_can_move_axis(axis, value.unwrap_or(false));
    }
    Ok(())
}

// =============================================================================
// PARK / UNPARK
// =============================================================================

/// Motion members that must refuse while parked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkedMotion {
    FindHome,
    MoveAxis(TelescopeAxis),
    PulseGuide,
    Slew(SlewSyncKind),
}

impl ParkedMotion {
    pub fn all() -> Vec<ParkedMotion> {
        let mut motions = vec![ParkedMotion::FindHome];
        motions.extend(TelescopeAxis::ALL.iter().map(|axis| ParkedMotion::MoveAxis(*axis)));
        motions.push(ParkedMotion::PulseGuide);
        motions.extend(SlewSyncKind::ALL.iter().map(|kind| ParkedMotion::Slew(*kind)));
        motions
    }

    pub fn name(&self) -> String {
        match self {
            ParkedMotion::FindHome => "FindHome".to_string(),
            ParkedMotion::MoveAxis(axis) => format!("MoveAxis({})", axis),
            ParkedMotion::PulseGuide => "PulseGuide".to_string(),
            ParkedMotion::Slew(kind) => kind.name().to_string(),
        }
    }

    /// Only members the device claims to support are fenced
    fn supported(&self, ctx: &RunContext) -> bool {
        match self {
            ParkedMotion::FindHome => ctx.caps.get(Capability::CanFindHome),
            ParkedMotion::MoveAxis(axis) => ctx.caps.can_move_axis(*axis),
            ParkedMotion::PulseGuide => ctx.caps.get(Capability::CanPulseGuide),
            ParkedMotion::Slew(kind) => ctx.caps.get(kind.capability()),
        }
    }

    fn call<'a>(&self, device: &'a dyn Telescope, ra: f64, dec: f64) -> BoxFuture<'a, DeviceResult<()>> {
        match *self {
            ParkedMotion::FindHome => device.find_home(),
            ParkedMotion::MoveAxis(axis) => device.move_axis(axis, 0.0),
            ParkedMotion::PulseGuide => device.pulse_guide(GuideDirection::East, 0),
            ParkedMotion::Slew(kind) if kind.is_horizontal() => slew::command(kind, device, 45.0, 180.0),
            ParkedMotion::Slew(kind) => slew::command(kind, device, ra, dec),
        }
    }
}

async fn wait_for_park_state(session: &TestSession<'_>, operation: &str, parked: bool) -> ConformResult<Duration> {
    let device = session.device;
    session
        .wait_while(
            operation,
            move || async move { device.at_park().await.map(|at_park| at_park != parked) },
            Duration::ZERO,
            session.settings.maximum_slew_time(),
        )
        .await
}

async fn park_and_unpark(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    let device = session.device;

    if !ctx.caps.get(Capability::CanPark) {
        session
            .invoke("Park", ctx.caps.requirement(Capability::CanPark), device.park())
            .await?;
        if !ctx.caps.get(Capability::CanUnpark) {
            session
                .invoke("Unpark", ctx.caps.requirement(Capability::CanUnpark), device.unpark())
                .await?;
        }
        return Ok(());
    }

    if !session
        .invoke("Park", ctx.caps.requirement(Capability::CanPark), device.park())
        .await?
    {
        return Ok(());
    }
    let elapsed = wait_for_park_state(session, "Park", true).await?;
    session.ok("Park", format!("AtPark became True after {:.1}s", elapsed.as_secs_f64()));

    match session.call("Park", device.park()).await? {
        Ok(()) => session.ok("Park", "Calling Park while already parked is harmless"),
        Err(error) => session.issue("Park", format!("Calling Park while already parked raised {}", error)),
    }

    check_parked_motion(session, ctx).await?;

    let at_park = session.require("AtPark", device.at_park()).await?;
    session.assert(
        "Parked:AtPark",
        at_park,
        format!("AtPark is {} after exercising motion members while parked", at_park),
    );

    let unpark_requirement = ctx.caps.requirement(Capability::CanUnpark);
    if !session.invoke("Unpark", unpark_requirement, device.unpark()).await? {
        if !ctx.caps.get(Capability::CanUnpark) {
            session.info("Unpark", "The mount cannot be unparked and remains parked");
        }
        return Ok(());
    }
    let elapsed = wait_for_park_state(session, "Unpark", false).await?;
    session.ok("Unpark", format!("AtPark became False after {:.1}s", elapsed.as_secs_f64()));
    Ok(())
}

/// Every supported motion member must refuse while the mount is parked
async fn check_parked_motion(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    let device = session.device;
    let lst = session.require("SiderealTime", device.sidereal_time()).await?;
    let ra = angles::ra_at_hour_angle(lst, 1.0);
    let dec = 0.0;

    // a missing target must not be the reason the ToTarget members refuse
    session.preset_target(ra, dec).await?;

    for motion in ParkedMotion::all() {
        if !motion.supported(ctx) {
            continue;
        }
        let name = motion.name();
        if session
            .expect_parked(&name, &ctx.profile, motion.call(device, ra, dec))
            .await?
        {
            slew::abort_quietly(session).await?;
        }
    }
    Ok(())
}

// =============================================================================
// SIMPLE METHODS
// =============================================================================

async fn abort_slew(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    let can_slew = [
        Capability::CanSlew,
        Capability::CanSlewAsync,
        Capability::CanSlewAltAz,
        Capability::CanSlewAltAzAsync,
    ]
    .iter()
    .any(|c| ctx.caps.get(*c));

    if session
        .invoke("AbortSlew", Requirement::mandatory_if(can_slew), session.device.abort_slew())
        .await?
    {
        session.ok("AbortSlew", "AbortSlew is harmless when the mount is not slewing");
    }
    Ok(())
}

async fn axis_rates(session: &TestSession<'_>, ctx: &mut RunContext) -> ConformResult<()> {
    for axis in TelescopeAxis::ALL {
        let name = format!("AxisRates({})", axis);
        let rates = match session
            .check(&name, Requirement::Mandatory, session.device.axis_rates(axis))
            .await?
        {
            Some(rates) => rates,
            None => continue,
        };

        let can_move = ctx.caps.can_move_axis(axis);
        if rates.is_empty() {
            session.assert(
                &name,
                !can_move,
                format!("No rates listed, {} is {}", capabilities::can_move_axis_name(axis), can_move),
            );
        } else {
            if !can_move {
                session.issue(
                    &name,
                    format!(
                        "{} rate ranges listed but {} is False",
                        rates.len(),
                        capabilities::can_move_axis_name(axis)
                    ),
                );
            }
            for rate in &rates {
                let valid = rate.minimum >= 0.0 && rate.minimum <= rate.maximum;
                session.assert(
                    &name,
                    valid,
                    format!("Range {:.6} to {:.6} degrees per second", rate.minimum, rate.maximum),
                );
            }
        }
        ctx.axis_rates[axis.index()] = rates;
    }
    Ok(())
}

async fn find_home(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    let device = session.device;
    if !session
        .invoke("FindHome", ctx.caps.requirement(Capability::CanFindHome), device.find_home())
        .await?
    {
        return Ok(());
    }

    let elapsed = session
        .wait_while(
            "FindHome",
            move || async move { device.at_home().await.map(|home| !home) },
            Duration::ZERO,
            session.settings.maximum_slew_time(),
        )
        .await?;
    session.wait_for_slew("FindHome", Duration::ZERO).await?;
    session.ok("FindHome", format!("AtHome became True after {:.1}s", elapsed.as_secs_f64()));
    Ok(())
}

async fn set_park(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    let requirement = ctx.caps.requirement(Capability::CanSetPark);
    if !ctx.caps.get(Capability::CanSetPark) {
        session.invoke("SetPark", requirement, session.device.set_park()).await?;
        return Ok(());
    }
    if !session.settings.allow_set_park {
        session.info("SetPark", "Skipped, overwriting the park position is not allowed");
        return Ok(());
    }
    if session.invoke("SetPark", requirement, session.device.set_park()).await? {
        session.ok("SetPark", "Park position set to the current position");
    }
    Ok(())
}

// =============================================================================
// MOVE AXIS
// =============================================================================

async fn stop_axis(session: &TestSession<'_>, name: &str, axis: TelescopeAxis) -> ConformResult<()> {
    if let Err(error) = session.call(name, session.device.move_axis(axis, 0.0)).await? {
        session.issue(name, format!("Unable to stop the {} axis: {}", axis, error));
    }
    Ok(())
}

async fn move_axis(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    let device = session.device;
    let settings = session.settings;

    for axis in TelescopeAxis::ALL {
        let name = format!("MoveAxis({})", axis);
        let can_move = ctx.caps.can_move_axis(axis);
        let requirement = Requirement::from_capability(capabilities::can_move_axis_name(axis), can_move);

        if !can_move {
            session.invoke(&name, requirement, device.move_axis(axis, 0.0)).await?;
            continue;
        }

        let maximum = ctx.axis_rates[axis.index()]
            .iter()
            .map(|rate| rate.maximum)
            .fold(0.0_f64, f64::max);
        if maximum <= 0.0 {
            session.info(&name, "Skipped, AxisRates lists no usable rate");
            continue;
        }

        let tracking_before = session.require("Tracking", device.tracking()).await?;

        let excessive = maximum + 1.0;
        session
            .expect_invalid(
                &format!("{} (Bad rate)", name),
                &format!("{:.3}", excessive),
                requirement,
                device.move_axis(axis, excessive),
            )
            .await?;
        stop_axis(session, &name, axis).await?;

        for rate in [maximum, -maximum] {
            if !session.invoke(&name, requirement, device.move_axis(axis, rate)).await? {
                stop_axis(session, &name, axis).await?;
                break;
            }
            let slewing = session.require("Slewing", device.slewing()).await?;
            session.assert(
                &name,
                slewing,
                format!("Slewing is {} while moving at {:+.3} degrees per second", slewing, rate),
            );

            session.pause(settings.poll_interval() * 4).await?;
            stop_axis(session, &name, axis).await?;

            let stopped = session
                .wait_while(
                    &name,
                    || device.slewing(),
                    Duration::ZERO,
                    settings.time_for_slewing_to_become_false(),
                )
                .await?;
            session.ok(
                &name,
                format!("Slewing became False {:.2}s after the axis was stopped", stopped.as_secs_f64()),
            );
        }

        let tracking_after = session.require("Tracking", device.tracking()).await?;
        session.assert(
            &name,
            tracking_after == tracking_before,
            format!("Tracking was {} before and {} after MoveAxis", tracking_before, tracking_after),
        );
    }
    Ok(())
}

// =============================================================================
// PULSE GUIDE
// =============================================================================

fn pulse_duration_ms(session: &TestSession<'_>) -> i32 {
    i32::try_from(session.settings.pulse_guide_duration_ms).unwrap_or(i32::MAX)
}

async fn wait_for_pulse(session: &TestSession<'_>, operation: &str, minimum: Duration) -> ConformResult<Duration> {
    let device = session.device;
    let pulse = Duration::from_millis(u64::from(session.settings.pulse_guide_duration_ms));
    session
        .wait_while(
            operation,
            || device.is_pulse_guiding(),
            minimum,
            pulse * 2 + session.settings.time_for_slewing_to_become_false(),
        )
        .await
}

async fn pulse_guide(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    let device = session.device;
    let requirement = ctx.caps.requirement(Capability::CanPulseGuide);
    let duration_ms = pulse_duration_ms(session);

    if !ctx.caps.get(Capability::CanPulseGuide) {
        session
            .invoke("PulseGuide", requirement, device.pulse_guide(GuideDirection::East, duration_ms))
            .await?;
        return Ok(());
    }

    let start = Instant::now();
    if !session
        .invoke("PulseGuide", requirement, device.pulse_guide(GuideDirection::East, duration_ms))
        .await?
    {
        return Ok(());
    }
    let returned_after = start.elapsed();

    match session.check("IsPulseGuiding", requirement, device.is_pulse_guiding()).await? {
        Some(true) => {
            let elapsed = wait_for_pulse(session, "PulseGuide", Duration::ZERO).await?;
            session.ok(
                "PulseGuide",
                format!(
                    "Asynchronous pulse guide, IsPulseGuiding cleared {:.2}s after the call returned",
                    elapsed.as_secs_f64()
                ),
            );
        }
        Some(false) => {
            let threshold = f64::from(duration_ms) / 1000.0 * SYNCHRONOUS_PULSE_FRACTION;
            if returned_after.as_secs_f64() >= threshold {
                session.ok("PulseGuide", "Synchronous pulse guide completed");
            } else {
                session.issue(
                    "PulseGuide",
                    format!(
                        "PulseGuide returned after {:.2}s of a {:.2}s pulse but IsPulseGuiding is False",
                        returned_after.as_secs_f64(),
                        f64::from(duration_ms) / 1000.0
                    ),
                );
            }
        }
        None => {}
    }

    if session.settings.extended_pulse_guide_tests {
        measure_pulse_guides(session, ctx).await?;
    }
    Ok(())
}

/// Pulse in each direction and compare the displacement with the guide rates
async fn measure_pulse_guides(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    let device = session.device;
    let requirement = ctx.caps.requirement(Capability::CanPulseGuide);
    let tolerance = session.settings.pulse_guide_tolerance_arcsec;
    let duration_ms = pulse_duration_ms(session);
    let seconds = f64::from(duration_ms) / 1000.0;

    if !slew::ensure_tracking(session, ctx, true).await? {
        session.info("PulseGuide", "Skipped displacement tests, tracking could not be enabled");
        return Ok(());
    }

    let latitude = slew::site_latitude(session, ctx).await?;
    slew::slew_to_hour_angle(session, ctx, "PulseGuide", 1.0, targets::test_declination(1.0, latitude)).await?;

    let rate_ra = session.require("GuideRateRightAscension", device.guide_rate_right_ascension()).await?;
    let rate_dec = session.require("GuideRateDeclination", device.guide_rate_declination()).await?;
    let ra_step = rate_ra * seconds * angles::ARCSEC_PER_DEGREE;
    let dec_step = rate_dec * seconds * angles::ARCSEC_PER_DEGREE;

    for direction in GuideDirection::ALL {
        let test = format!("PulseGuide {}", direction);
        let (expected_ra, expected_dec) = match direction {
            GuideDirection::North => (0.0, dec_step),
            GuideDirection::South => (0.0, -dec_step),
            GuideDirection::East => (ra_step, 0.0),
            GuideDirection::West => (-ra_step, 0.0),
        };

        let ra_before = session.require("RightAscension", device.right_ascension()).await?;
        let dec_before = session.require("Declination", device.declination()).await?;

        if !session
            .invoke(&test, requirement, device.pulse_guide(direction, duration_ms))
            .await?
        {
            continue;
        }
        wait_for_pulse(session, &test, Duration::from_millis(u64::from(session.settings.pulse_guide_duration_ms)))
            .await?;

        let ra_after = session.require("RightAscension", device.right_ascension()).await?;
        let dec_after = session.require("Declination", device.declination()).await?;
        let ra_moved = angles::ra_difference_arcsec(ra_after, ra_before);
        let dec_moved = angles::degrees_difference_arcsec(dec_after, dec_before);

        session.assert(
            &test,
            angles::within_tolerance(ra_moved, expected_ra, tolerance)
                && angles::within_tolerance(dec_moved, expected_dec, tolerance),
            format!(
                "Moved {:+.1}\" RA and {:+.1}\" Dec, expected {:+.1}\" RA and {:+.1}\" Dec (tolerance {:.1}\")",
                ra_moved, dec_moved, expected_ra, expected_dec, tolerance
            ),
        );
    }
    Ok(())
}

// =============================================================================
// PIER SIDE
// =============================================================================

async fn side_of_pier_write(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    const TEST: &str = "SideOfPier Write";
    let device = session.device;
    let requirement = ctx.caps.requirement(Capability::CanSetPierSide);

    if !ctx.caps.get(Capability::CanSetPierSide) {
        session.invoke(TEST, requirement, device.set_side_of_pier(PierSide::East)).await?;
        return Ok(());
    }

    let original = session.require("SideOfPier", device.side_of_pier()).await?;
    if original == PierSide::Unknown {
        session.info(TEST, "Skipped, SideOfPier reads pierUnknown");
        return Ok(());
    }

    for side in [original.opposite(), original] {
        if !session.invoke(TEST, requirement, device.set_side_of_pier(side)).await? {
            return Ok(());
        }
        session.wait_for_slew(TEST, Duration::ZERO).await?;
        let actual = session.require("SideOfPier", device.side_of_pier()).await?;
        session.assert(
            TEST,
            actual == side,
            format!("SideOfPier reads {} after being set to {}", actual, side),
        );
    }
    Ok(())
}

async fn destination_side_of_pier(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    const TEST: &str = "DestinationSideOfPier";
    let device = session.device;
    let lst = session.require("SiderealTime", device.sidereal_time()).await?;
    let latitude = slew::site_latitude(session, ctx).await?;

    let mut predictions = Vec::with_capacity(DESTINATION_HOUR_ANGLES.len());
    for ha in DESTINATION_HOUR_ANGLES {
        let target = targets::EquatorialTarget::at_hour_angle(lst, ha, targets::test_declination(ha, latitude));
        match session
            .check(TEST, Requirement::Optional, device.destination_side_of_pier(target.ra, target.dec))
            .await?
        {
            Some(side) => predictions.push(side),
            None => return Ok(()),
        }
    }

    let (west, east) = (predictions[0], predictions[1]);
    let message = format!("HA -3h predicts {}, HA +3h predicts {}", west, east);
    if ctx.is_german_polar() {
        session.assert(TEST, west != east, message);
    } else {
        session.info(TEST, message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelescopeSettings;
    use crate::device::AlignmentMode;
    use crate::interface::InterfaceProfile;
    use crate::report::{Outcome, RecordingReporter};
    use crate::simulator::{SimulatedTelescope, SimulatorConfig};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    async fn discovered(session: &TestSession<'_>, version: i16) -> RunContext {
        let mut ctx = RunContext::new(InterfaceProfile::from_version(version));
        ctx.alignment_mode = Some(AlignmentMode::GermanPolar);
        capabilities::discover(session, &mut ctx).await.unwrap();
        read_can_move_axis(session, &mut ctx, false).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_all_methods_pass_on_simulator() {
        let device = SimulatedTelescope::default();
        let mut settings = TelescopeSettings::fast_for_tests();
        settings.extended_pulse_guide_tests = true;
        settings.allow_set_park = true;
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let mut ctx = discovered(&session, 4).await;

        check_methods(&session, &mut ctx).await.unwrap();

        assert!(reporter.defects().is_empty(), "{:?}", reporter.defects());
        assert!(reporter.has("Park", Outcome::Ok));
        assert!(reporter.has("Parked:AtPark", Outcome::Ok));
        assert!(reporter.has("Unpark", Outcome::Ok));
        assert!(reporter.has("FindHome", Outcome::Ok));
        assert!(reporter.has("MoveAxis(Primary)", Outcome::Ok));
        assert!(reporter.has("MoveAxis(Tertiary)", Outcome::Ok));
        assert!(reporter.has("PulseGuide North", Outcome::Ok));
        assert!(reporter.has("SideOfPier Write", Outcome::Ok));
        assert!(reporter.has("DestinationSideOfPier", Outcome::Ok));
        assert_eq!(ctx.axis_rates[0].len(), 1);
        assert!(ctx.axis_rates[2].is_empty());
        assert!(!device.at_park().await.unwrap());
    }

    #[tokio::test]
    async fn test_pulse_without_motion_is_issue() {
        let mut config = SimulatorConfig::default();
        config.faults.pulse_guide_ignored = true;
        let device = SimulatedTelescope::new(config);
        let mut settings = TelescopeSettings::fast_for_tests();
        settings.pulse_guide_tolerance_arcsec = 0.5;
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let ctx = discovered(&session, 4).await;

        measure_pulse_guides(&session, &ctx).await.unwrap();

        for direction in GuideDirection::ALL {
            let test = format!("PulseGuide {}", direction);
            assert_eq!(reporter.outcomes(&test), vec![Outcome::Issue], "{}", test);
        }
    }

    #[tokio::test]
    async fn test_pulse_displacement_within_tight_tolerance() {
        let device = SimulatedTelescope::default();
        let mut settings = TelescopeSettings::fast_for_tests();
        settings.pulse_guide_tolerance_arcsec = 0.5;
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let ctx = discovered(&session, 4).await;

        measure_pulse_guides(&session, &ctx).await.unwrap();

        assert!(reporter.defects().is_empty(), "{:?}", reporter.defects());
        assert!(reporter.has("PulseGuide South", Outcome::Ok));
    }

    #[tokio::test]
    async fn test_parked_move_axis_is_rejected() {
        let device = SimulatedTelescope::default();
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let ctx = discovered(&session, 4).await;

        park_and_unpark(&session, &ctx).await.unwrap();

        assert_eq!(reporter.outcomes("Parked:MoveAxis(Primary)"), vec![Outcome::Ok]);
        assert_eq!(reporter.outcomes("Parked:AtPark"), vec![Outcome::Ok]);
        assert!(reporter.for_test("Parked:AbortSlew").is_empty());
    }

    #[tokio::test]
    async fn test_generic_parked_error_depends_on_generation() {
        for (version, expected) in [(4, Outcome::Issue), (3, Outcome::Ok)] {
            let mut config = SimulatorConfig::default();
            config.interface_version = version;
            config.faults.generic_parked_error = true;
            let device = SimulatedTelescope::new(config);
            let settings = TelescopeSettings::fast_for_tests();
            let reporter = RecordingReporter::new();
            let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
            let ctx = discovered(&session, version).await;

            park_and_unpark(&session, &ctx).await.unwrap();
            assert!(reporter.has("Parked:SlewToCoordinates", expected), "V{}", version);
        }
    }

    #[tokio::test]
    async fn test_missing_capabilities_must_refuse() {
        let mut config = SimulatorConfig::default();
        config.capabilities.can_find_home = false;
        config.capabilities.can_pulse_guide = false;
        config.capabilities.can_set_park = false;
        config.capabilities.can_set_pier_side = false;
        let device = SimulatedTelescope::new(config);
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let ctx = discovered(&session, 4).await;

        find_home(&session, &ctx).await.unwrap();
        pulse_guide(&session, &ctx).await.unwrap();
        set_park(&session, &ctx).await.unwrap();
        side_of_pier_write(&session, &ctx).await.unwrap();

        for test in ["FindHome", "PulseGuide", "SetPark", "SideOfPier Write"] {
            assert_eq!(reporter.outcomes(test), vec![Outcome::Ok], "{}", test);
        }
    }

    #[tokio::test]
    async fn test_set_park_needs_permission() {
        let device = SimulatedTelescope::default();
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let ctx = discovered(&session, 4).await;

        set_park(&session, &ctx).await.unwrap();
        assert_eq!(reporter.outcomes("SetPark"), vec![Outcome::Info]);
    }

    #[tokio::test]
    async fn test_axis_members_skipped_before_v2() {
        let device = SimulatedTelescope::default();
        let settings = TelescopeSettings::fast_for_tests();
        let reporter = RecordingReporter::new();
        let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
        let mut ctx = RunContext::new(InterfaceProfile::from_version(1));

        run_method(MethodCheck::MoveAxis, &session, &mut ctx).await.unwrap();
        assert_eq!(reporter.outcomes("MoveAxis"), vec![Outcome::Info]);
    }
}
