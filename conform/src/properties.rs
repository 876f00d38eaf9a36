//! Property verification
//!
//! Each property is read, checked against its legal range and, where it is
//! writable, probed with out-of-range values, written with a legal value and
//! read back. Original values are restored afterwards; a failed restore is
//! reported but never stops the run.

use crate::angles;
use crate::capabilities::Capability;
use crate::classify::{self, Requirement};
use crate::device::{DeviceResult, DriveRate, ErrorKind};
use crate::error::ConformResult;
use crate::session::{RunContext, TestSession};
use chrono::Utc;
use std::fmt;
use std::future::Future;

/// Sidereal time within this many seconds of the local calculation is Ok
const SIDEREAL_TIME_OK_SECS: f64 = 2.0;

/// Sidereal time within this many seconds is reported as Info
const SIDEREAL_TIME_INFO_SECS: f64 = 300.0;

/// UTCDate within this many seconds of the system clock is Ok
const UTC_DATE_OK_SECS: f64 = 10.0;

/// Value written to a rate offset that cannot be set
const RATE_OFFSET_PROBE: f64 = 0.1;

const TARGET_DECLINATION_PROBE: f64 = 1.0;
const TARGET_RIGHT_ASCENSION_PROBE: f64 = 12.0;

/// Legal range for a numeric property
#[derive(Debug, Clone, Copy)]
struct Bounds {
    min: f64,
    max: f64,
    max_inclusive: bool,
}

impl Bounds {
    const fn closed(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            max_inclusive: true,
        }
    }

    const fn half_open(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            max_inclusive: false,
        }
    }

    fn contains(&self, value: f64) -> bool {
        value >= self.min && (value < self.max || (self.max_inclusive && value == self.max))
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let close = if self.max_inclusive { ']' } else { ')' };
        write!(f, "[{}, {}{}", self.min, self.max, close)
    }
}

const ALTITUDE_BOUNDS: Bounds = Bounds::closed(0.0, 90.0);
const AZIMUTH_BOUNDS: Bounds = Bounds::half_open(0.0, 360.0);
const DECLINATION_BOUNDS: Bounds = Bounds::closed(-90.0, 90.0);
const HOURS_BOUNDS: Bounds = Bounds::half_open(0.0, 24.0);
const LATITUDE_BOUNDS: Bounds = Bounds::closed(-90.0, 90.0);
const LONGITUDE_BOUNDS: Bounds = Bounds::closed(-180.0, 180.0);
const ELEVATION_BOUNDS: Bounds = Bounds::closed(-300.0, 10_000.0);

/// How a written value is compared with what is read back
#[derive(Clone, Copy)]
struct Comparison {
    tolerance: f64,
    difference: fn(f64, f64) -> f64,
    show: fn(f64) -> String,
}

fn plain_difference(a: f64, b: f64) -> f64 {
    (a - b).abs()
}

fn ra_difference(a: f64, b: f64) -> f64 {
    angles::ra_difference_arcsec(a, b).abs()
}

fn dec_difference(a: f64, b: f64) -> f64 {
    angles::degrees_difference_arcsec(a, b).abs()
}

fn show_plain(value: f64) -> String {
    format!("{}", value)
}

const RATE_COMPARISON: Comparison = Comparison {
    tolerance: 1e-6,
    difference: plain_difference,
    show: show_plain,
};

const SITE_ANGLE_COMPARISON: Comparison = Comparison {
    tolerance: 1.0,
    difference: dec_difference,
    show: angles::format_dms,
};

const ELEVATION_COMPARISON: Comparison = Comparison {
    tolerance: 0.5,
    difference: plain_difference,
    show: show_plain,
};

// =============================================================================
// PROPERTY KINDS
// =============================================================================

/// Every property check, in the order they run.
///
/// Site properties come before SiderealTime, which compares against the site
/// longitude read earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyCheck {
    AlignmentMode,
    Altitude,
    ApertureArea,
    ApertureDiameter,
    AtHome,
    AtPark,
    Azimuth,
    Declination,
    DeclinationRate,
    DoesRefraction,
    EquatorialSystem,
    FocalLength,
    GuideRateDeclination,
    GuideRateRightAscension,
    IsPulseGuiding,
    RightAscension,
    RightAscensionRate,
    SiteElevation,
    SiteLatitude,
    SiteLongitude,
    SiderealTime,
    SideOfPier,
    Slewing,
    SlewSettleTime,
    TargetDeclination,
    TargetRightAscension,
    Tracking,
    TrackingRates,
    TrackingRate,
    UtcDate,
}

impl PropertyCheck {
    pub const ALL: [PropertyCheck; 30] = [
        PropertyCheck::AlignmentMode,
        PropertyCheck::Altitude,
        PropertyCheck::ApertureArea,
        PropertyCheck::ApertureDiameter,
        PropertyCheck::AtHome,
        PropertyCheck::AtPark,
        PropertyCheck::Azimuth,
        PropertyCheck::Declination,
        PropertyCheck::DeclinationRate,
        PropertyCheck::DoesRefraction,
        PropertyCheck::EquatorialSystem,
        PropertyCheck::FocalLength,
        PropertyCheck::GuideRateDeclination,
        PropertyCheck::GuideRateRightAscension,
        PropertyCheck::IsPulseGuiding,
        PropertyCheck::RightAscension,
        PropertyCheck::RightAscensionRate,
        PropertyCheck::SiteElevation,
        PropertyCheck::SiteLatitude,
        PropertyCheck::SiteLongitude,
        PropertyCheck::SiderealTime,
        PropertyCheck::SideOfPier,
        PropertyCheck::Slewing,
        PropertyCheck::SlewSettleTime,
        PropertyCheck::TargetDeclination,
        PropertyCheck::TargetRightAscension,
        PropertyCheck::Tracking,
        PropertyCheck::TrackingRates,
        PropertyCheck::TrackingRate,
        PropertyCheck::UtcDate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PropertyCheck::AlignmentMode => "AlignmentMode",
            PropertyCheck::Altitude => "Altitude",
            PropertyCheck::ApertureArea => "ApertureArea",
            PropertyCheck::ApertureDiameter => "ApertureDiameter",
            PropertyCheck::AtHome => "AtHome",
            PropertyCheck::AtPark => "AtPark",
            PropertyCheck::Azimuth => "Azimuth",
            PropertyCheck::Declination => "Declination",
            PropertyCheck::DeclinationRate => "DeclinationRate",
            PropertyCheck::DoesRefraction => "DoesRefraction",
            PropertyCheck::EquatorialSystem => "EquatorialSystem",
            PropertyCheck::FocalLength => "FocalLength",
            PropertyCheck::GuideRateDeclination => "GuideRateDeclination",
            PropertyCheck::GuideRateRightAscension => "GuideRateRightAscension",
            PropertyCheck::IsPulseGuiding => "IsPulseGuiding",
            PropertyCheck::RightAscension => "RightAscension",
            PropertyCheck::RightAscensionRate => "RightAscensionRate",
            PropertyCheck::SiteElevation => "SiteElevation",
            PropertyCheck::SiteLatitude => "SiteLatitude",
            PropertyCheck::SiteLongitude => "SiteLongitude",
            PropertyCheck::SiderealTime => "SiderealTime",
            PropertyCheck::SideOfPier => "SideOfPier",
            PropertyCheck::Slewing => "Slewing",
            PropertyCheck::SlewSettleTime => "SlewSettleTime",
            PropertyCheck::TargetDeclination => "TargetDeclination",
            PropertyCheck::TargetRightAscension => "TargetRightAscension",
            PropertyCheck::Tracking => "Tracking",
            PropertyCheck::TrackingRates => "TrackingRates",
            PropertyCheck::TrackingRate => "TrackingRate",
            PropertyCheck::UtcDate => "UTCDate",
        }
    }
}

/// Run every property check, each isolated from the others
pub async fn check_properties(session: &TestSession<'_>, ctx: &mut RunContext) -> ConformResult<()> {
    tracing::info!("Checking properties");
    for check in PropertyCheck::ALL {
        session.run_step(check.name(), run_property(check, session, ctx)).await?;
    }
    Ok(())
}

pub async fn run_property(check: PropertyCheck, session: &TestSession<'_>, ctx: &mut RunContext) -> ConformResult<()> {
    let device = session.device;
    match check {
        PropertyCheck::AlignmentMode => {
            if let Some(mode) = session
                .check("AlignmentMode", Requirement::Optional, device.alignment_mode())
                .await?
            {
                session.ok("AlignmentMode", mode.to_string());
                ctx.alignment_mode = Some(mode);
            }
            Ok(())
        }
        PropertyCheck::Altitude => {
            ctx.snapshot.altitude = read_bounded(
                session,
                "Altitude",
                Requirement::Optional,
                device.altitude(),
                ALTITUDE_BOUNDS,
                angles::format_dms,
            )
            .await?;
            Ok(())
        }
        PropertyCheck::ApertureArea => optical_dimension(session, "ApertureArea", device.aperture_area()).await,
        PropertyCheck::ApertureDiameter => {
            optical_dimension(session, "ApertureDiameter", device.aperture_diameter()).await
        }
        PropertyCheck::AtHome => read_flag(session, "AtHome", device.at_home()).await.map(|_| ()),
        PropertyCheck::AtPark => read_flag(session, "AtPark", device.at_park()).await.map(|_| ()),
        PropertyCheck::Azimuth => {
            ctx.snapshot.azimuth = read_bounded(
                session,
                "Azimuth",
                Requirement::Optional,
                device.azimuth(),
                AZIMUTH_BOUNDS,
                angles::format_dms,
            )
            .await?;
            Ok(())
        }
        PropertyCheck::Declination => {
            ctx.snapshot.declination = read_bounded(
                session,
                "Declination",
                Requirement::Mandatory,
                device.declination(),
                DECLINATION_BOUNDS,
                angles::format_dms,
            )
            .await?;
            Ok(())
        }
        PropertyCheck::DeclinationRate => {
            rate_offset_property(
                session,
                ctx,
                "DeclinationRate",
                Capability::CanSetDeclinationRate,
                session.settings.rate_offset_low_arcsec_per_sec,
                || device.declination_rate(),
                |rate| device.set_declination_rate(rate),
            )
            .await
        }
        PropertyCheck::DoesRefraction => does_refraction(session).await,
        PropertyCheck::EquatorialSystem => {
            let requirement = Requirement::mandatory_if(ctx.profile.has_equatorial_system);
            if let Some(system) = session
                .check("EquatorialSystem", requirement, device.equatorial_system())
                .await?
            {
                session.ok("EquatorialSystem", system.to_string());
            }
            Ok(())
        }
        PropertyCheck::FocalLength => optical_dimension(session, "FocalLength", device.focal_length()).await,
        PropertyCheck::GuideRateDeclination => {
            guide_rate_property(
                session,
                ctx,
                "GuideRateDeclination",
                || device.guide_rate_declination(),
                |rate| device.set_guide_rate_declination(rate),
            )
            .await
        }
        PropertyCheck::GuideRateRightAscension => {
            guide_rate_property(
                session,
                ctx,
                "GuideRateRightAscension",
                || device.guide_rate_right_ascension(),
                |rate| device.set_guide_rate_right_ascension(rate),
            )
            .await
        }
        PropertyCheck::IsPulseGuiding => {
            let requirement = ctx.caps.requirement(Capability::CanPulseGuide);
            if let Some(guiding) = session
                .check("IsPulseGuiding", requirement, device.is_pulse_guiding())
                .await?
            {
                session.assert(
                    "IsPulseGuiding",
                    !guiding,
                    if guiding {
                        "IsPulseGuiding is True when no pulse guide is in progress"
                    } else {
                        "false"
                    },
                );
            }
            Ok(())
        }
        PropertyCheck::RightAscension => {
            ctx.snapshot.right_ascension = read_bounded(
                session,
                "RightAscension",
                Requirement::Mandatory,
                device.right_ascension(),
                HOURS_BOUNDS,
                angles::format_hms,
            )
            .await?;
            Ok(())
        }
        PropertyCheck::RightAscensionRate => {
            rate_offset_property(
                session,
                ctx,
                "RightAscensionRate",
                Capability::CanSetRightAscensionRate,
                RATE_OFFSET_PROBE,
                || device.right_ascension_rate(),
                |rate| device.set_right_ascension_rate(rate),
            )
            .await
        }
        PropertyCheck::SiteElevation => {
            ctx.snapshot.site_elevation = site_property(
                session,
                SiteProperty {
                    member: "SiteElevation",
                    bounds: ELEVATION_BOUNDS,
                    invalid: [-301.0, 10_001.0],
                    alternate: |e: f64| if e < 9_000.0 { e + 100.0 } else { e - 100.0 },
                    comparison: ELEVATION_COMPARISON,
                },
                || device.site_elevation(),
                |e| device.set_site_elevation(e),
            )
            .await?;
            Ok(())
        }
        PropertyCheck::SiteLatitude => {
            ctx.snapshot.site_latitude = site_property(
                session,
                SiteProperty {
                    member: "SiteLatitude",
                    bounds: LATITUDE_BOUNDS,
                    invalid: [-91.0, 91.0],
                    alternate: |lat: f64| if lat < 80.0 { lat + 1.0 } else { lat - 1.0 },
                    comparison: SITE_ANGLE_COMPARISON,
                },
                || device.site_latitude(),
                |lat| device.set_site_latitude(lat),
            )
            .await?;
            Ok(())
        }
        PropertyCheck::SiteLongitude => {
            ctx.snapshot.site_longitude = site_property(
                session,
                SiteProperty {
                    member: "SiteLongitude",
                    bounds: LONGITUDE_BOUNDS,
                    invalid: [-181.0, 181.0],
                    alternate: |lon: f64| if lon < 170.0 { lon + 1.0 } else { lon - 1.0 },
                    comparison: SITE_ANGLE_COMPARISON,
                },
                || device.site_longitude(),
                |lon| device.set_site_longitude(lon),
            )
            .await?;
            Ok(())
        }
        PropertyCheck::SiderealTime => sidereal_time(session, ctx).await,
        PropertyCheck::SideOfPier => {
            match session.call("SideOfPier Read", device.side_of_pier()).await? {
                Ok(side) => {
                    session.ok("SideOfPier Read", side.to_string());
                    ctx.caps.set_side_of_pier_readable(true);
                    ctx.snapshot.side_of_pier = Some(side);
                }
                Err(error) => {
                    session.report_verdict(
                        "SideOfPier Read",
                        classify::classify_error("SideOfPier Read", &error, Requirement::Optional),
                    );
                    ctx.caps.set_side_of_pier_readable(false);
                }
            }
            Ok(())
        }
        PropertyCheck::Slewing => {
            if let Some(slewing) = session.check("Slewing", Requirement::Mandatory, device.slewing()).await? {
                session.assert(
                    "Slewing",
                    !slewing,
                    if slewing {
                        "Slewing is True while the mount should be idle"
                    } else {
                        "false"
                    },
                );
                ctx.snapshot.slewing = Some(slewing);
            }
            Ok(())
        }
        PropertyCheck::SlewSettleTime => slew_settle_time(session).await,
        PropertyCheck::TargetDeclination => {
            let comparison = Comparison {
                tolerance: session.settings.slew_tolerance_arcsec,
                difference: dec_difference,
                show: angles::format_dms,
            };
            target_property(
                session,
                ctx,
                "TargetDeclination",
                [-91.0, 91.0],
                TARGET_DECLINATION_PROBE,
                comparison,
                || device.target_declination(),
                |dec| device.set_target_declination(dec),
            )
            .await
        }
        PropertyCheck::TargetRightAscension => {
            let comparison = Comparison {
                tolerance: session.settings.slew_tolerance_arcsec,
                difference: ra_difference,
                show: angles::format_hms,
            };
            target_property(
                session,
                ctx,
                "TargetRightAscension",
                [-1.0, 25.0],
                TARGET_RIGHT_ASCENSION_PROBE,
                comparison,
                || device.target_right_ascension(),
                |ra| device.set_target_right_ascension(ra),
            )
            .await
        }
        PropertyCheck::Tracking => tracking(session, ctx).await,
        PropertyCheck::TrackingRates => {
            let requirement = Requirement::mandatory_if(ctx.profile.has_tracking_rates);
            if let Some(rates) = session.check("TrackingRates", requirement, device.tracking_rates()).await? {
                let listed = rates.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ");
                if rates.contains(&DriveRate::Sidereal) {
                    session.ok("TrackingRates", listed);
                } else {
                    session.issue("TrackingRates", format!("Sidereal is missing from the list: {}", listed));
                }
                ctx.tracking_rates = rates;
            }
            Ok(())
        }
        PropertyCheck::TrackingRate => tracking_rate(session, ctx).await,
        PropertyCheck::UtcDate => utc_date(session).await,
    }
}

// =============================================================================
// SHARED HELPERS
// =============================================================================

/// Read a numeric property and check it lies within `bounds`
async fn read_bounded<F>(
    session: &TestSession<'_>,
    member: &str,
    requirement: Requirement,
    call: F,
    bounds: Bounds,
    show: fn(f64) -> String,
) -> ConformResult<Option<f64>>
where
    F: Future<Output = DeviceResult<f64>>,
{
    let value = match session.check(member, requirement, call).await? {
        Some(value) => value,
        None => return Ok(None),
    };
    if bounds.contains(value) {
        session.ok(member, show(value));
    } else {
        session.issue(member, format!("{} is outside the range {}", show(value), bounds));
    }
    Ok(Some(value))
}

async fn read_flag<F>(session: &TestSession<'_>, member: &str, call: F) -> ConformResult<Option<bool>>
where
    F: Future<Output = DeviceResult<bool>>,
{
    let value = session.check(member, Requirement::Mandatory, call).await?;
    if let Some(value) = value {
        session.ok(member, value.to_string());
    }
    Ok(value)
}

/// Write `value`, read it back and compare. Returns false when the write
/// was refused, which has already been reported.
async fn write_verified<W, R>(
    session: &TestSession<'_>,
    member: &str,
    requirement: Requirement,
    value: f64,
    comparison: Comparison,
    write: W,
    read: R,
) -> ConformResult<bool>
where
    W: Future<Output = DeviceResult<()>>,
    R: Future<Output = DeviceResult<f64>>,
{
    if !session.invoke(member, requirement, write).await? {
        return Ok(false);
    }
    let actual = session.require(member, read).await?;
    let show = comparison.show;
    if (comparison.difference)(actual, value) <= comparison.tolerance {
        session.ok(member, format!("Wrote {}, read back {}", show(value), show(actual)));
    } else {
        session.issue(
            member,
            format!("Wrote {} but read back {}", show(value), show(actual)),
        );
    }
    Ok(true)
}

/// Like [`write_verified`] for values compared exactly
async fn write_exact<T, W, R>(
    session: &TestSession<'_>,
    member: &str,
    requirement: Requirement,
    value: T,
    write: W,
    read: R,
) -> ConformResult<bool>
where
    T: PartialEq + fmt::Display,
    W: Future<Output = DeviceResult<()>>,
    R: Future<Output = DeviceResult<T>>,
{
    if !session.invoke(member, requirement, write).await? {
        return Ok(false);
    }
    let actual = session.require(member, read).await?;
    if actual == value {
        session.ok(member, format!("Wrote {}, read back {}", value, actual));
    } else {
        session.issue(member, format!("Wrote {} but read back {}", value, actual));
    }
    Ok(true)
}

/// Put an original value back. Failure is an Issue, not an abort.
async fn restore<F>(session: &TestSession<'_>, member: &str, call: F) -> ConformResult<()>
where
    F: Future<Output = DeviceResult<()>>,
{
    if let Err(error) = session.call(member, call).await? {
        session.issue(member, format!("Unable to restore the original value: {}", error));
    }
    Ok(())
}

async fn optical_dimension<F>(session: &TestSession<'_>, member: &str, call: F) -> ConformResult<()>
where
    F: Future<Output = DeviceResult<f64>>,
{
    if let Some(value) = session.check(member, Requirement::Optional, call).await? {
        if value < 0.0 {
            session.issue(member, format!("{} is negative", value));
        } else if value == 0.0 {
            session.info(member, "0 - the value is probably unknown to the driver");
        } else {
            session.ok(member, value.to_string());
        }
    }
    Ok(())
}

// =============================================================================
// WRITABLE PROPERTIES
// =============================================================================

async fn rate_offset_property<R, RF, W, WF>(
    session: &TestSession<'_>,
    ctx: &RunContext,
    member: &'static str,
    capability: Capability,
    probe: f64,
    read: R,
    write: W,
) -> ConformResult<()>
where
    R: Fn() -> RF,
    RF: Future<Output = DeviceResult<f64>>,
    W: Fn(f64) -> WF,
    WF: Future<Output = DeviceResult<()>>,
{
    let read_member = format!("{} Read", member);
    let write_member = format!("{} Write", member);
    let can_set = ctx.caps.get(capability);

    if let Some(rate) = session.check(&read_member, Requirement::Mandatory, read()).await? {
        if !can_set && rate != 0.0 {
            session.issue(
                &read_member,
                format!("{} is {} but {} is False, it must read 0.0", member, rate, capability),
            );
        } else {
            session.ok(&read_member, format!("{:.6}", rate));
        }
    }

    let requirement = ctx.caps.requirement(capability);
    if !can_set {
        session.invoke(&write_member, requirement, write(probe)).await?;
        return Ok(());
    }

    for value in [0.0, probe] {
        if !write_verified(session, &write_member, requirement, value, RATE_COMPARISON, write(value), read()).await? {
            return Ok(());
        }
    }
    restore(session, &write_member, write(0.0)).await
}

async fn guide_rate_property<R, RF, W, WF>(
    session: &TestSession<'_>,
    ctx: &RunContext,
    member: &'static str,
    read: R,
    write: W,
) -> ConformResult<()>
where
    R: Fn() -> RF,
    RF: Future<Output = DeviceResult<f64>>,
    W: Fn(f64) -> WF,
    WF: Future<Output = DeviceResult<()>>,
{
    let read_member = format!("{} Read", member);
    let write_member = format!("{} Write", member);
    let required = ctx.caps.get(Capability::CanPulseGuide) || ctx.caps.get(Capability::CanSetGuideRates);

    let rate = session
        .check(&read_member, Requirement::mandatory_if(required), read())
        .await?;
    if let Some(rate) = rate {
        if rate < 0.0 {
            session.issue(&read_member, format!("{} is negative", rate));
        } else {
            session.ok(&read_member, format!("{:.6} degrees/second", rate));
        }
    }

    let requirement = ctx.caps.requirement(Capability::CanSetGuideRates);
    if !ctx.caps.get(Capability::CanSetGuideRates) {
        session
            .invoke(&write_member, requirement, write(rate.unwrap_or(0.0)))
            .await?;
        return Ok(());
    }

    session
        .expect_invalid(&write_member, "-1.0", requirement, write(-1.0))
        .await?;
    if let Some(rate) = rate {
        write_verified(session, &write_member, requirement, rate, RATE_COMPARISON, write(rate), read()).await?;
    }
    Ok(())
}

async fn does_refraction(session: &TestSession<'_>) -> ConformResult<()> {
    let device = session.device;
    let value = match session
        .check("DoesRefraction Read", Requirement::Optional, device.does_refraction())
        .await?
    {
        Some(value) => value,
        None => return Ok(()),
    };
    session.ok("DoesRefraction Read", value.to_string());

    if write_exact(
        session,
        "DoesRefraction Write",
        Requirement::Optional,
        !value,
        device.set_does_refraction(!value),
        device.does_refraction(),
    )
    .await?
    {
        restore(session, "DoesRefraction Write", device.set_does_refraction(value)).await?;
    }
    Ok(())
}

/// Static description of a site property
struct SiteProperty {
    member: &'static str,
    bounds: Bounds,
    invalid: [f64; 2],
    alternate: fn(f64) -> f64,
    comparison: Comparison,
}

async fn site_property<R, RF, W, WF>(
    session: &TestSession<'_>,
    site: SiteProperty,
    read: R,
    write: W,
) -> ConformResult<Option<f64>>
where
    R: Fn() -> RF,
    RF: Future<Output = DeviceResult<f64>>,
    W: Fn(f64) -> WF,
    WF: Future<Output = DeviceResult<()>>,
{
    let read_member = format!("{} Read", site.member);
    let write_member = format!("{} Write", site.member);

    let original = read_bounded(
        session,
        &read_member,
        Requirement::Optional,
        read(),
        site.bounds,
        site.comparison.show,
    )
    .await?;

    for bad in site.invalid {
        session
            .expect_invalid(&write_member, &bad.to_string(), Requirement::Optional, write(bad))
            .await?;
    }

    let original = match original {
        Some(original) => original,
        None => return Ok(None),
    };

    let written = write_verified(
        session,
        &write_member,
        Requirement::Optional,
        original,
        site.comparison,
        write(original),
        read(),
    )
    .await?;

    if written && session.settings.extended_site_tests {
        let alternate = (site.alternate)(original);
        write_verified(
            session,
            &write_member,
            Requirement::Optional,
            alternate,
            site.comparison,
            write(alternate),
            read(),
        )
        .await?;
        restore(session, &write_member, write(original)).await?;
    }
    Ok(Some(original))
}

async fn sidereal_time(session: &TestSession<'_>, ctx: &mut RunContext) -> ConformResult<()> {
    let lst = read_bounded(
        session,
        "SiderealTime",
        Requirement::Mandatory,
        session.device.sidereal_time(),
        HOURS_BOUNDS,
        angles::format_hms,
    )
    .await?;
    ctx.snapshot.sidereal_time = lst;

    let (lst, longitude) = match (lst, ctx.snapshot.site_longitude) {
        (Some(lst), Some(longitude)) => (lst, longitude),
        (Some(_), None) => {
            session.info("SiderealTime", "SiteLongitude is unavailable, skipping the local comparison");
            return Ok(());
        }
        _ => return Ok(()),
    };

    let expected = angles::sidereal_time_at(&Utc::now(), longitude);
    let seconds = angles::ra_difference_hours(lst, expected).abs() * 3600.0;
    if seconds <= SIDEREAL_TIME_OK_SECS {
        session.ok(
            "SiderealTime",
            format!("Matches the locally calculated value {}", angles::format_hms(expected)),
        );
    } else if seconds <= SIDEREAL_TIME_INFO_SECS {
        session.info(
            "SiderealTime",
            format!("Differs from the locally calculated {} by {:.1}s", angles::format_hms(expected), seconds),
        );
    } else {
        session.issue(
            "SiderealTime",
            format!(
                "{} differs from the locally calculated {} by {:.1} minutes",
                angles::format_hms(lst),
                angles::format_hms(expected),
                seconds / 60.0
            ),
        );
    }
    Ok(())
}

async fn slew_settle_time(session: &TestSession<'_>) -> ConformResult<()> {
    let device = session.device;
    let original = session
        .check("SlewSettleTime Read", Requirement::Optional, device.slew_settle_time())
        .await?;
    if let Some(value) = original {
        if value < 0 {
            session.issue("SlewSettleTime Read", format!("{} is negative", value));
        } else {
            session.ok("SlewSettleTime Read", format!("{}s", value));
        }
    }

    session
        .expect_invalid(
            "SlewSettleTime Write",
            "-1",
            Requirement::Optional,
            device.set_slew_settle_time(-1),
        )
        .await?;

    if let Some(value) = original.filter(|v| *v >= 0) {
        write_exact(
            session,
            "SlewSettleTime Write",
            Requirement::Optional,
            value,
            device.set_slew_settle_time(value),
            device.slew_settle_time(),
        )
        .await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn target_property<R, RF, W, WF>(
    session: &TestSession<'_>,
    ctx: &RunContext,
    member: &'static str,
    invalid: [f64; 2],
    legal: f64,
    comparison: Comparison,
    read: R,
    write: W,
) -> ConformResult<()>
where
    R: Fn() -> RF,
    RF: Future<Output = DeviceResult<f64>>,
    W: Fn(f64) -> WF,
    WF: Future<Output = DeviceResult<()>>,
{
    let read_member = format!("{} Read", member);
    let write_member = format!("{} Write", member);
    let can_position = ctx.caps.get(Capability::CanSlew)
        || ctx.caps.get(Capability::CanSlewAsync)
        || ctx.caps.get(Capability::CanSync);
    let requirement = Requirement::mandatory_if(can_position);

    if session.settings.first_use_tests {
        match session.call(&read_member, read()).await? {
            Ok(value) => session.issue(
                &read_member,
                format!(
                    "Read {} before any value was written, an InvalidOperation or ValueNotSet error was expected",
                    (comparison.show)(value)
                ),
            ),
            Err(error) if error.is(ErrorKind::InvalidOperation) || error.is(ErrorKind::ValueNotSet) => session.ok(
                &read_member,
                format!("Correctly raised {} before a value was written", error.kind),
            ),
            Err(error) => session.report_verdict(
                &read_member,
                classify::classify_error(&read_member, &error, requirement),
            ),
        }
    }

    for bad in invalid {
        session
            .expect_invalid(&write_member, &bad.to_string(), requirement, write(bad))
            .await?;
    }

    write_verified(session, &write_member, requirement, legal, comparison, write(legal), read()).await?;
    Ok(())
}

async fn tracking(session: &TestSession<'_>, ctx: &mut RunContext) -> ConformResult<()> {
    let device = session.device;
    let value = match read_flag(session, "Tracking Read", device.tracking()).await? {
        Some(value) => value,
        None => return Ok(()),
    };
    ctx.snapshot.tracking = Some(value);

    let requirement = ctx.caps.requirement(Capability::CanSetTracking);
    if !ctx.caps.get(Capability::CanSetTracking) {
        session
            .invoke("Tracking Write", requirement, device.set_tracking(value))
            .await?;
        return Ok(());
    }

    if write_exact(
        session,
        "Tracking Write",
        requirement,
        !value,
        device.set_tracking(!value),
        device.tracking(),
    )
    .await?
    {
        restore(session, "Tracking Write", device.set_tracking(value)).await?;
    }
    Ok(())
}

async fn tracking_rate(session: &TestSession<'_>, ctx: &RunContext) -> ConformResult<()> {
    let device = session.device;
    let requirement = Requirement::mandatory_if(ctx.profile.has_tracking_rates);
    let original = match session
        .check("TrackingRate Read", requirement, device.tracking_rate())
        .await?
    {
        Some(rate) => rate,
        None => return Ok(()),
    };
    session.ok("TrackingRate Read", original.to_string());

    let rates = if ctx.tracking_rates.is_empty() {
        vec![original]
    } else {
        ctx.tracking_rates.clone()
    };

    for rate in rates {
        if !write_exact(
            session,
            "TrackingRate Write",
            requirement,
            rate,
            device.set_tracking_rate(rate),
            device.tracking_rate(),
        )
        .await?
        {
            return Ok(());
        }
    }
    restore(session, "TrackingRate Write", device.set_tracking_rate(original)).await
}

async fn utc_date(session: &TestSession<'_>) -> ConformResult<()> {
    let device = session.device;
    let date = match session
        .check("UTCDate Read", Requirement::Mandatory, device.utc_date())
        .await?
    {
        Some(date) => date,
        None => return Ok(()),
    };

    let seconds = (date - Utc::now()).num_milliseconds().abs() as f64 / 1000.0;
    if seconds <= UTC_DATE_OK_SECS {
        session.ok("UTCDate Read", date.format("%Y-%m-%d %H:%M:%S%.3f").to_string());
    } else {
        session.info(
            "UTCDate Read",
            format!("{} differs from the system clock by {:.1}s", date.format("%Y-%m-%d %H:%M:%S"), seconds),
        );
    }

    if session
        .invoke("UTCDate Write", Requirement::Optional, device.set_utc_date(date))
        .await?
    {
        session.ok("UTCDate Write", "Accepted the value that was read");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities;
    use crate::device::Telescope;
    use crate::config::TelescopeSettings;
    use crate::interface::InterfaceProfile;
    use crate::report::{Outcome, RecordingReporter};
    use crate::simulator::{SimulatedTelescope, SimulatorConfig};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    async fn run(config: SimulatorConfig, settings: TelescopeSettings) -> (SimulatedTelescope, RecordingReporter) {
        let device = SimulatedTelescope::new(config);
        let reporter = RecordingReporter::new();
        {
            let session = TestSession::new(&device, &settings, &reporter, Arc::new(AtomicBool::new(false)));
            let mut ctx = RunContext::new(InterfaceProfile::from_version(4));
            capabilities::discover(&session, &mut ctx).await.unwrap();
            check_properties(&session, &mut ctx).await.unwrap();
        }
        (device, reporter)
    }

    #[test]
    fn test_bounds() {
        assert!(AZIMUTH_BOUNDS.contains(0.0));
        assert!(!AZIMUTH_BOUNDS.contains(360.0));
        assert!(ALTITUDE_BOUNDS.contains(90.0));
        assert!(!ELEVATION_BOUNDS.contains(-301.0));
        assert_eq!(HOURS_BOUNDS.to_string(), "[0, 24)");
    }

    #[tokio::test]
    async fn test_well_behaved_device_has_no_defects() {
        let mut settings = TelescopeSettings::fast_for_tests();
        settings.extended_site_tests = true;
        let (_, reporter) = run(SimulatorConfig::default(), settings).await;
        assert!(reporter.defects().is_empty(), "{:?}", reporter.defects());
        assert!(reporter.has("SiderealTime", Outcome::Ok));
        assert!(reporter.has("TargetDeclination Read", Outcome::Ok));
    }

    #[tokio::test]
    async fn test_unsettable_declination_rate_reads_zero_and_refuses_writes() {
        let mut config = SimulatorConfig::default();
        config.capabilities.can_set_declination_rate = false;
        let (_, reporter) = run(config, TelescopeSettings::fast_for_tests()).await;

        assert_eq!(reporter.outcomes("DeclinationRate Read"), vec![Outcome::Ok]);
        assert_eq!(reporter.outcomes("DeclinationRate Write"), vec![Outcome::Ok]);
    }

    #[tokio::test]
    async fn test_nonzero_declination_rate_without_capability_is_issue() {
        let mut config = SimulatorConfig::default();
        config.capabilities.can_set_declination_rate = false;
        config.faults.declination_rate_reads_nonzero = true;
        let (_, reporter) = run(config, TelescopeSettings::fast_for_tests()).await;
        assert!(reporter.has("DeclinationRate Read", Outcome::Issue));
    }

    #[tokio::test]
    async fn test_site_elevation_limits_and_retention() {
        let (device, reporter) = run(SimulatorConfig::default(), TelescopeSettings::fast_for_tests()).await;

        let outcomes = reporter.outcomes("SiteElevation Write");
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| *o == Outcome::Ok));
        assert_eq!(device.site_elevation().await.unwrap(), 80.0);
    }

    #[tokio::test]
    async fn test_accepting_out_of_range_site_is_issue() {
        let mut config = SimulatorConfig::default();
        config.faults.accept_out_of_range_site = true;
        let (device, reporter) = run(config, TelescopeSettings::fast_for_tests()).await;

        assert!(reporter.has("SiteLatitude Write", Outcome::Issue));
        assert!(reporter.has("SiteElevation Write", Outcome::Issue));
        // the legal write afterwards puts the original back
        assert_eq!(device.site_latitude().await.unwrap(), 51.0);
    }

    #[tokio::test]
    async fn test_optional_and_mandatory_failures() {
        let mut config = SimulatorConfig::default();
        config.faults.failing_members = vec!["Altitude".to_string(), "Declination".to_string()];
        let (_, reporter) = run(config, TelescopeSettings::fast_for_tests()).await;

        assert_eq!(reporter.outcomes("Altitude"), vec![Outcome::Info]);
        assert_eq!(reporter.outcomes("Declination"), vec![Outcome::Issue]);
        assert!(reporter.has("RightAscension", Outcome::Ok));
    }

    #[tokio::test]
    async fn test_tracking_is_restored() {
        let (device, reporter) = run(SimulatorConfig::default(), TelescopeSettings::fast_for_tests()).await;
        assert!(reporter.has("Tracking Write", Outcome::Ok));
        assert!(!device.tracking().await.unwrap());
        assert_eq!(device.tracking_rate().await.unwrap(), DriveRate::Sidereal);
    }
}
