//! Simulated telescope
//!
//! A complete in-process implementation of [`Telescope`] with a time-based
//! position model. Position only changes when [`MountState::advance`] runs,
//! which every member does before touching state:
//!
//! - not tracking: the mount is fixed in alt/az, so RA follows sidereal time
//! - tracking: RA/Dec are fixed apart from rate offsets
//! - pulse guides and MoveAxis add motion for the time they are active
//! - slews, park, home and pier flips jump to their goal when their time is up
//!
//! Fault switches make it misbehave in specific, testable ways.

use crate::angles::{self, SIDEREAL_RATE_ARCSEC_PER_SEC, SIDEREAL_RATE_RATIO};
use crate::device::{
    AlignmentMode, AxisRate, DeviceError, DeviceResult, DriveRate, EquatorialSystem, ErrorKind, GuideDirection,
    PierSide, Telescope, TelescopeAxis,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default guide rate, half sidereal, in degrees per second
const DEFAULT_GUIDE_RATE: f64 = 0.5 * SIDEREAL_RATE_ARCSEC_PER_SEC / 3600.0;

/// Fastest MoveAxis rate in degrees per second
const MAX_AXIS_RATE: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorCapabilities {
    pub can_find_home: bool,
    pub can_park: bool,
    pub can_pulse_guide: bool,
    pub can_set_declination_rate: bool,
    pub can_set_guide_rates: bool,
    pub can_set_park: bool,
    pub can_set_pier_side: bool,
    pub can_set_right_ascension_rate: bool,
    pub can_set_tracking: bool,
    pub can_slew: bool,
    pub can_slew_alt_az: bool,
    pub can_slew_alt_az_async: bool,
    pub can_slew_async: bool,
    pub can_sync: bool,
    pub can_sync_alt_az: bool,
    pub can_unpark: bool,
    pub can_move_axis: [bool; 3],
}

impl Default for SimulatorCapabilities {
    fn default() -> Self {
        Self {
            can_find_home: true,
            can_park: true,
            can_pulse_guide: true,
            can_set_declination_rate: true,
            can_set_guide_rates: true,
            can_set_park: true,
            can_set_pier_side: true,
            can_set_right_ascension_rate: true,
            can_set_tracking: true,
            can_slew: true,
            can_slew_alt_az: true,
            can_slew_alt_az_async: true,
            can_slew_async: true,
            can_sync: true,
            can_sync_alt_az: true,
            can_unpark: true,
            can_move_axis: [true, true, false],
        }
    }
}

/// Deliberate misbehaviour
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorFaults {
    /// Site writes accept any value
    pub accept_out_of_range_site: bool,
    /// SideOfPier reports the physical side, which flips beyond ±6h
    pub report_physical_pier_side: bool,
    /// Parked rejections use a generic error instead of InvalidWhileParked
    pub generic_parked_error: bool,
    /// Slewing always reads false and motions complete at once
    pub slewing_never_set: bool,
    /// DeclinationRate reads non-zero even when it cannot be set
    pub declination_rate_reads_nonzero: bool,
    /// PulseGuide is accepted and IsPulseGuiding set, but the mount never moves
    pub pulse_guide_ignored: bool,
    /// RightAscensionRate and DeclinationRate read back but do not move the mount
    pub rate_offsets_ignored: bool,
    /// Members (by interface name) that always fail with a generic error
    pub failing_members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub interface_version: i16,
    pub alignment_mode: AlignmentModeSetting,
    pub site_latitude: f64,
    pub site_longitude: f64,
    pub site_elevation: f64,
    /// Duration of slews, park, home and pier flips
    pub slew_duration_ms: u64,
    pub capabilities: SimulatorCapabilities,
    pub faults: SimulatorFaults,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            interface_version: 4,
            alignment_mode: AlignmentModeSetting::GermanPolar,
            site_latitude: 51.0,
            site_longitude: -1.0,
            site_elevation: 80.0,
            slew_duration_ms: 100,
            capabilities: SimulatorCapabilities::default(),
            faults: SimulatorFaults::default(),
        }
    }
}

impl SimulatorConfig {
    fn slew_duration(&self) -> Duration {
        if self.faults.slewing_never_set {
            Duration::ZERO
        } else {
            Duration::from_millis(self.slew_duration_ms)
        }
    }
}

/// Serializable mirror of [`AlignmentMode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlignmentModeSetting {
    AltAz,
    Polar,
    GermanPolar,
}

impl From<AlignmentModeSetting> for AlignmentMode {
    fn from(mode: AlignmentModeSetting) -> Self {
        match mode {
            AlignmentModeSetting::AltAz => AlignmentMode::AltAz,
            AlignmentModeSetting::Polar => AlignmentMode::Polar,
            AlignmentModeSetting::GermanPolar => AlignmentMode::GermanPolar,
        }
    }
}

// =============================================================================
// MOUNT STATE
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Goal {
    Equatorial { ra: f64, dec: f64 },
    Horizontal { altitude: f64, azimuth: f64 },
    Park,
    Home,
    Flip(PierSide),
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    goal: Goal,
    end: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Pulse {
    direction: GuideDirection,
    start: Instant,
    end: Instant,
}

#[derive(Debug)]
struct MountState {
    ra: f64,
    dec: f64,
    pier_side: PierSide,
    tracking: bool,
    tracking_rate: DriveRate,
    ra_rate: f64,
    dec_rate: f64,
    guide_rate_ra: f64,
    guide_rate_dec: f64,
    does_refraction: bool,
    slew_settle_time: i16,
    target_ra: Option<f64>,
    target_dec: Option<f64>,
    latitude: f64,
    longitude: f64,
    elevation: f64,
    utc_offset: chrono::Duration,
    at_park: bool,
    at_home: bool,
    park_position: (f64, f64),
    motion: Option<Motion>,
    axis_rates: [f64; 3],
    ra_pulse: Option<Pulse>,
    dec_pulse: Option<Pulse>,
    pulses_move: bool,
    offsets_move: bool,
    last_update: Instant,
}

fn utc_at(instant: Instant) -> DateTime<Utc> {
    let back = Instant::now().saturating_duration_since(instant);
    Utc::now() - chrono::Duration::from_std(back).unwrap_or_else(|_| chrono::Duration::zero())
}

fn side_for_hour_angle(hour_angle: f64) -> PierSide {
    if hour_angle >= 0.0 {
        PierSide::East
    } else {
        PierSide::West
    }
}

/// Seconds of `[start, end]` that fall inside `[from, to]`
fn overlap_secs(from: Instant, to: Instant, start: Instant, end: Instant) -> f64 {
    let lo = from.max(start);
    let hi = to.min(end);
    if hi > lo {
        (hi - lo).as_secs_f64()
    } else {
        0.0
    }
}

impl MountState {
    fn new(config: &SimulatorConfig) -> Self {
        let now = Instant::now();
        let lst = angles::sidereal_time_at(&Utc::now(), config.site_longitude);
        let park_altitude = config.site_latitude.abs();
        let park_azimuth = if config.site_latitude >= 0.0 { 0.0 } else { 180.0 };

        Self {
            ra: angles::ra_at_hour_angle(lst, 1.0),
            dec: 45.0,
            pier_side: PierSide::East,
            tracking: false,
            tracking_rate: DriveRate::Sidereal,
            ra_rate: 0.0,
            dec_rate: 0.0,
            guide_rate_ra: DEFAULT_GUIDE_RATE,
            guide_rate_dec: DEFAULT_GUIDE_RATE,
            does_refraction: false,
            slew_settle_time: 0,
            target_ra: None,
            target_dec: None,
            latitude: config.site_latitude,
            longitude: config.site_longitude,
            elevation: config.site_elevation,
            utc_offset: chrono::Duration::zero(),
            at_park: false,
            at_home: false,
            park_position: (park_altitude, park_azimuth),
            motion: None,
            axis_rates: [0.0; 3],
            ra_pulse: None,
            dec_pulse: None,
            pulses_move: !config.faults.pulse_guide_ignored,
            offsets_move: !config.faults.rate_offsets_ignored,
            last_update: now,
        }
    }

    fn lst_at(&self, instant: Instant) -> f64 {
        angles::sidereal_time_at(&utc_at(instant), self.longitude)
    }

    fn lst(&self) -> f64 {
        self.lst_at(Instant::now())
    }

    fn hour_angle(&self) -> f64 {
        angles::hour_angle(self.lst(), self.ra)
    }

    fn horizontal(&self) -> (f64, f64) {
        angles::equatorial_to_horizontal(self.hour_angle(), self.dec, self.latitude)
    }

    fn place_horizontal(&mut self, altitude: f64, azimuth: f64, at: Instant) {
        let (ha, dec) = angles::horizontal_to_equatorial(altitude, azimuth, self.latitude);
        self.ra = angles::ra_at_hour_angle(self.lst_at(at), ha);
        self.dec = dec;
        self.pier_side = side_for_hour_angle(ha);
    }

    fn complete(&mut self, motion: Motion) {
        match motion.goal {
            Goal::Equatorial { ra, dec } => {
                self.ra = ra;
                self.dec = dec;
                self.pier_side = side_for_hour_angle(angles::hour_angle(self.lst_at(motion.end), ra));
            }
            Goal::Horizontal { altitude, azimuth } => self.place_horizontal(altitude, azimuth, motion.end),
            Goal::Park => {
                let (altitude, azimuth) = self.park_position;
                self.place_horizontal(altitude, azimuth, motion.end);
                self.tracking = false;
                self.at_park = true;
            }
            Goal::Home => {
                let azimuth = if self.latitude >= 0.0 { 180.0 } else { 0.0 };
                self.place_horizontal(45.0, azimuth, motion.end);
                self.at_home = true;
            }
            Goal::Flip(side) => self.pier_side = side,
        }
    }

    /// Bring the position model up to the present
    fn advance(&mut self) {
        let now = Instant::now();

        if let Some(motion) = self.motion {
            if now < motion.end {
                self.last_update = now;
                return;
            }
            self.motion = None;
            self.complete(motion);
            self.last_update = self.last_update.max(motion.end);
        }

        let from = self.last_update;
        if now <= from {
            return;
        }
        let dt = (now - from).as_secs_f64();

        if self.tracking {
            if self.offsets_move {
                // Seconds of RA per sidereal second
                self.ra += self.ra_rate * dt * SIDEREAL_RATE_RATIO / 3600.0;
                self.dec += self.dec_rate * dt / 3600.0;
            }
        } else {
            self.ra += dt * SIDEREAL_RATE_RATIO / 3600.0;
        }

        if let Some(pulse) = self.ra_pulse {
            let secs = self.pulse_secs(from, now, &pulse);
            let hours = self.guide_rate_ra * secs / 15.0;
            match pulse.direction {
                GuideDirection::East => self.ra += hours,
                GuideDirection::West => self.ra -= hours,
                _ => {}
            }
            if pulse.end <= now {
                self.ra_pulse = None;
            }
        }
        if let Some(pulse) = self.dec_pulse {
            let secs = self.pulse_secs(from, now, &pulse);
            let degrees = self.guide_rate_dec * secs;
            match pulse.direction {
                GuideDirection::North => self.dec += degrees,
                GuideDirection::South => self.dec -= degrees,
                _ => {}
            }
            if pulse.end <= now {
                self.dec_pulse = None;
            }
        }

        self.ra -= self.axis_rates[0] * dt / 15.0;
        self.dec += self.axis_rates[1] * dt;

        self.ra = angles::normalize_hours(self.ra);
        self.dec = angles::clamp_latitude_like(self.dec);
        self.last_update = now;
    }

    fn pulse_secs(&self, from: Instant, to: Instant, pulse: &Pulse) -> f64 {
        if self.pulses_move {
            overlap_secs(from, to, pulse.start, pulse.end)
        } else {
            0.0
        }
    }

    fn slewing(&self) -> bool {
        self.motion.is_some() || self.axis_rates.iter().any(|r| *r != 0.0)
    }

    fn start_motion(&mut self, goal: Goal, duration: Duration) {
        self.at_home = false;
        let motion = Motion {
            goal,
            end: Instant::now() + duration,
        };
        if duration.is_zero() {
            self.complete(motion);
            self.last_update = Instant::now();
        } else {
            self.motion = Some(motion);
        }
    }

    fn parked_error(&self, member: &str, config: &SimulatorConfig) -> DeviceError {
        if config.faults.generic_parked_error {
            DeviceError::other(format!("{}: mount is parked", member))
        } else {
            DeviceError::parked(member)
        }
    }

    fn ensure_unparked(&self, member: &str, config: &SimulatorConfig) -> DeviceResult<()> {
        if self.at_park {
            Err(self.parked_error(member, config))
        } else {
            Ok(())
        }
    }

    fn validate_equatorial(ra: f64, dec: f64) -> DeviceResult<()> {
        if !(0.0..24.0).contains(&ra) {
            return Err(DeviceError::invalid_value(format!("Right ascension {} is outside 0 to 24 hours", ra)));
        }
        if !(-90.0..=90.0).contains(&dec) {
            return Err(DeviceError::invalid_value(format!("Declination {} is outside -90 to 90 degrees", dec)));
        }
        Ok(())
    }

    fn validate_horizontal(altitude: f64, azimuth: f64) -> DeviceResult<()> {
        if !(-90.0..=90.0).contains(&altitude) {
            return Err(DeviceError::invalid_value(format!("Altitude {} is outside -90 to 90 degrees", altitude)));
        }
        if !(0.0..360.0).contains(&azimuth) {
            return Err(DeviceError::invalid_value(format!("Azimuth {} is outside 0 to 360 degrees", azimuth)));
        }
        Ok(())
    }

    fn require_tracking(&self, member: &str, tracking: bool) -> DeviceResult<()> {
        if self.tracking == tracking {
            Ok(())
        } else if tracking {
            Err(DeviceError::invalid_operation(format!("{} requires tracking to be enabled", member)))
        } else {
            Err(DeviceError::invalid_operation(format!("{} requires tracking to be disabled", member)))
        }
    }

    fn target(&self, member: &str) -> DeviceResult<(f64, f64)> {
        match (self.target_ra, self.target_dec) {
            (Some(ra), Some(dec)) => Ok((ra, dec)),
            _ => Err(DeviceError::invalid_operation(format!("{}: target coordinates have not been set", member))),
        }
    }

    fn start_equatorial_slew(
        &mut self,
        config: &SimulatorConfig,
        member: &str,
        ra: f64,
        dec: f64,
    ) -> DeviceResult<Duration> {
        self.ensure_unparked(member, config)?;
        Self::validate_equatorial(ra, dec)?;
        self.require_tracking(member, true)?;
        self.target_ra = Some(ra);
        self.target_dec = Some(dec);
        let duration = config.slew_duration();
        self.start_motion(Goal::Equatorial { ra, dec }, duration);
        Ok(duration)
    }

    fn start_horizontal_slew(
        &mut self,
        config: &SimulatorConfig,
        member: &str,
        altitude: f64,
        azimuth: f64,
    ) -> DeviceResult<Duration> {
        self.ensure_unparked(member, config)?;
        Self::validate_horizontal(altitude, azimuth)?;
        self.require_tracking(member, false)?;
        let duration = config.slew_duration();
        self.start_motion(Goal::Horizontal { altitude, azimuth }, duration);
        Ok(duration)
    }

    fn offsets_allowed(&self) -> bool {
        self.tracking_rate == DriveRate::Sidereal
    }

    fn reported_side(&self, side: PierSide, hour_angle: f64, config: &SimulatorConfig) -> PierSide {
        if config.faults.report_physical_pier_side && hour_angle.abs() > 6.0 {
            side.opposite()
        } else {
            side
        }
    }
}

// =============================================================================
// SIMULATED TELESCOPE
// =============================================================================

pub struct SimulatedTelescope {
    config: SimulatorConfig,
    state: Mutex<MountState>,
    connected: AtomicBool,
}

impl Default for SimulatedTelescope {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl SimulatedTelescope {
    pub fn new(config: SimulatorConfig) -> Self {
        let state = MountState::new(&config);
        Self {
            config,
            state: Mutex::new(state),
            connected: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Lock the state, bring it up to date and run `f`
    fn with_state<T>(
        &self,
        member: &str,
        f: impl FnOnce(&mut MountState, &SimulatorConfig) -> DeviceResult<T>,
    ) -> DeviceResult<T> {
        if self.config.faults.failing_members.iter().any(|m| m == member) {
            return Err(DeviceError::other(format!("{} failed (injected fault)", member)));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.advance();
        f(&mut state, &self.config)
    }

    fn capability(&self, member: &str, value: bool) -> DeviceResult<bool> {
        self.with_state(member, |_, _| Ok(value))
    }

    /// Synchronous members return once their motion is over
    async fn settle(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration + Duration::from_millis(2)).await;
        }
    }

    fn not_implemented<T>(member: &str) -> DeviceResult<T> {
        Err(DeviceError::not_implemented(member))
    }
}

#[async_trait]
impl Telescope for SimulatedTelescope {
    // =========================================================================
    // COMMON MEMBERS
    // =========================================================================

    async fn connected(&self) -> DeviceResult<bool> {
        self.with_state("Connected", |_, _| Ok(self.connected.load(Ordering::Relaxed)))
    }

    async fn set_connected(&self, connected: bool) -> DeviceResult<()> {
        self.with_state("Connected", |_, _| {
            self.connected.store(connected, Ordering::Relaxed);
            Ok(())
        })
    }

    async fn name(&self) -> DeviceResult<String> {
        self.with_state("Name", |_, _| Ok("Telescope Simulator".to_string()))
    }

    async fn description(&self) -> DeviceResult<String> {
        self.with_state("Description", |_, _| Ok("In-process telescope simulator".to_string()))
    }

    async fn driver_info(&self) -> DeviceResult<String> {
        self.with_state("DriverInfo", |_, _| Ok("telescope_conform simulator".to_string()))
    }

    async fn driver_version(&self) -> DeviceResult<String> {
        self.with_state("DriverVersion", |_, _| Ok(env!("CARGO_PKG_VERSION").to_string()))
    }

    async fn interface_version(&self) -> DeviceResult<i16> {
        self.with_state("InterfaceVersion", |_, c| Ok(c.interface_version))
    }

    async fn supported_actions(&self) -> DeviceResult<Vec<String>> {
        self.with_state("SupportedActions", |_, _| Ok(Vec::new()))
    }

    // =========================================================================
    // CAPABILITIES
    // =========================================================================

    async fn can_find_home(&self) -> DeviceResult<bool> {
        self.capability("CanFindHome", self.config.capabilities.can_find_home)
    }

    async fn can_park(&self) -> DeviceResult<bool> {
        self.capability("CanPark", self.config.capabilities.can_park)
    }

    async fn can_pulse_guide(&self) -> DeviceResult<bool> {
        self.capability("CanPulseGuide", self.config.capabilities.can_pulse_guide)
    }

    async fn can_set_declination_rate(&self) -> DeviceResult<bool> {
        self.capability("CanSetDeclinationRate", self.config.capabilities.can_set_declination_rate)
    }

    async fn can_set_guide_rates(&self) -> DeviceResult<bool> {
        self.capability("CanSetGuideRates", self.config.capabilities.can_set_guide_rates)
    }

    async fn can_set_park(&self) -> DeviceResult<bool> {
        self.capability("CanSetPark", self.config.capabilities.can_set_park)
    }

    async fn can_set_pier_side(&self) -> DeviceResult<bool> {
        self.capability("CanSetPierSide", self.config.capabilities.can_set_pier_side)
    }

    async fn can_set_right_ascension_rate(&self) -> DeviceResult<bool> {
        self.capability("CanSetRightAscensionRate", self.config.capabilities.can_set_right_ascension_rate)
    }

    async fn can_set_tracking(&self) -> DeviceResult<bool> {
        self.capability("CanSetTracking", self.config.capabilities.can_set_tracking)
    }

    async fn can_slew(&self) -> DeviceResult<bool> {
        self.capability("CanSlew", self.config.capabilities.can_slew)
    }

    async fn can_slew_alt_az(&self) -> DeviceResult<bool> {
        self.capability("CanSlewAltAz", self.config.capabilities.can_slew_alt_az)
    }

    async fn can_slew_alt_az_async(&self) -> DeviceResult<bool> {
        self.capability("CanSlewAltAzAsync", self.config.capabilities.can_slew_alt_az_async)
    }

    async fn can_slew_async(&self) -> DeviceResult<bool> {
        self.capability("CanSlewAsync", self.config.capabilities.can_slew_async)
    }

    async fn can_sync(&self) -> DeviceResult<bool> {
        self.capability("CanSync", self.config.capabilities.can_sync)
    }

    async fn can_sync_alt_az(&self) -> DeviceResult<bool> {
        self.capability("CanSyncAltAz", self.config.capabilities.can_sync_alt_az)
    }

    async fn can_unpark(&self) -> DeviceResult<bool> {
        self.capability("CanUnpark", self.config.capabilities.can_unpark)
    }

    async fn can_move_axis(&self, axis: TelescopeAxis) -> DeviceResult<bool> {
        self.capability("CanMoveAxis", self.config.capabilities.can_move_axis[axis.index()])
    }

    // =========================================================================
    // PROPERTIES
    // =========================================================================

    async fn alignment_mode(&self) -> DeviceResult<AlignmentMode> {
        self.with_state("AlignmentMode", |_, c| Ok(c.alignment_mode.into()))
    }

    async fn altitude(&self) -> DeviceResult<f64> {
        self.with_state("Altitude", |s, _| Ok(s.horizontal().0))
    }

    async fn aperture_area(&self) -> DeviceResult<f64> {
        self.with_state("ApertureArea", |_, _| Ok(0.0269))
    }

    async fn aperture_diameter(&self) -> DeviceResult<f64> {
        self.with_state("ApertureDiameter", |_, _| Ok(0.2))
    }

    async fn at_home(&self) -> DeviceResult<bool> {
        self.with_state("AtHome", |s, _| Ok(s.at_home))
    }

    async fn at_park(&self) -> DeviceResult<bool> {
        self.with_state("AtPark", |s, _| Ok(s.at_park))
    }

    async fn azimuth(&self) -> DeviceResult<f64> {
        self.with_state("Azimuth", |s, _| Ok(s.horizontal().1))
    }

    async fn declination(&self) -> DeviceResult<f64> {
        self.with_state("Declination", |s, _| Ok(s.dec))
    }

    async fn declination_rate(&self) -> DeviceResult<f64> {
        self.with_state("DeclinationRate", |s, c| {
            if !c.capabilities.can_set_declination_rate {
                return Ok(if c.faults.declination_rate_reads_nonzero { 0.5 } else { 0.0 });
            }
            Ok(if s.offsets_allowed() { s.dec_rate } else { 0.0 })
        })
    }

    async fn set_declination_rate(&self, rate: f64) -> DeviceResult<()> {
        self.with_state("DeclinationRate", |s, c| {
            if !c.capabilities.can_set_declination_rate {
                return Self::not_implemented("DeclinationRate write");
            }
            if !s.offsets_allowed() {
                return Err(DeviceError::invalid_operation(format!(
                    "DeclinationRate cannot be set while tracking at {} rate",
                    s.tracking_rate
                )));
            }
            s.dec_rate = rate;
            Ok(())
        })
    }

    async fn does_refraction(&self) -> DeviceResult<bool> {
        self.with_state("DoesRefraction", |s, _| Ok(s.does_refraction))
    }

    async fn set_does_refraction(&self, value: bool) -> DeviceResult<()> {
        self.with_state("DoesRefraction", |s, _| {
            s.does_refraction = value;
            Ok(())
        })
    }

    async fn equatorial_system(&self) -> DeviceResult<EquatorialSystem> {
        self.with_state("EquatorialSystem", |_, _| Ok(EquatorialSystem::Topocentric))
    }

    async fn focal_length(&self) -> DeviceResult<f64> {
        self.with_state("FocalLength", |_, _| Ok(1.26))
    }

    async fn guide_rate_declination(&self) -> DeviceResult<f64> {
        self.with_state("GuideRateDeclination", |s, c| {
            if !(c.capabilities.can_pulse_guide || c.capabilities.can_set_guide_rates) {
                return Self::not_implemented("GuideRateDeclination");
            }
            Ok(s.guide_rate_dec)
        })
    }

    async fn set_guide_rate_declination(&self, rate: f64) -> DeviceResult<()> {
        self.with_state("GuideRateDeclination", |s, c| {
            if !c.capabilities.can_set_guide_rates {
                return Self::not_implemented("GuideRateDeclination write");
            }
            if !(0.0..=MAX_AXIS_RATE).contains(&rate) {
                return Err(DeviceError::invalid_value(format!("Guide rate {} is out of range", rate)));
            }
            s.guide_rate_dec = rate;
            Ok(())
        })
    }

    async fn guide_rate_right_ascension(&self) -> DeviceResult<f64> {
        self.with_state("GuideRateRightAscension", |s, c| {
            if !(c.capabilities.can_pulse_guide || c.capabilities.can_set_guide_rates) {
                return Self::not_implemented("GuideRateRightAscension");
            }
            Ok(s.guide_rate_ra)
        })
    }

    async fn set_guide_rate_right_ascension(&self, rate: f64) -> DeviceResult<()> {
        self.with_state("GuideRateRightAscension", |s, c| {
            if !c.capabilities.can_set_guide_rates {
                return Self::not_implemented("GuideRateRightAscension write");
            }
            if !(0.0..=MAX_AXIS_RATE).contains(&rate) {
                return Err(DeviceError::invalid_value(format!("Guide rate {} is out of range", rate)));
            }
            s.guide_rate_ra = rate;
            Ok(())
        })
    }

    async fn is_pulse_guiding(&self) -> DeviceResult<bool> {
        self.with_state("IsPulseGuiding", |s, c| {
            if !c.capabilities.can_pulse_guide {
                return Self::not_implemented("IsPulseGuiding");
            }
            Ok(s.ra_pulse.is_some() || s.dec_pulse.is_some())
        })
    }

    async fn right_ascension(&self) -> DeviceResult<f64> {
        self.with_state("RightAscension", |s, _| Ok(s.ra))
    }

    async fn right_ascension_rate(&self) -> DeviceResult<f64> {
        self.with_state("RightAscensionRate", |s, _| Ok(if s.offsets_allowed() { s.ra_rate } else { 0.0 }))
    }

    async fn set_right_ascension_rate(&self, rate: f64) -> DeviceResult<()> {
        self.with_state("RightAscensionRate", |s, c| {
            if !c.capabilities.can_set_right_ascension_rate {
                return Self::not_implemented("RightAscensionRate write");
            }
            if !s.offsets_allowed() {
                return Err(DeviceError::invalid_operation(format!(
                    "RightAscensionRate cannot be set while tracking at {} rate",
                    s.tracking_rate
                )));
            }
            s.ra_rate = rate;
            Ok(())
        })
    }

    async fn side_of_pier(&self) -> DeviceResult<PierSide> {
        self.with_state("SideOfPier", |s, c| {
            let ha = s.hour_angle();
            Ok(s.reported_side(s.pier_side, ha, c))
        })
    }

    async fn set_side_of_pier(&self, side: PierSide) -> DeviceResult<()> {
        let duration = self.with_state("SideOfPier", |s, c| {
            if !c.capabilities.can_set_pier_side {
                return Self::not_implemented("SideOfPier write");
            }
            s.ensure_unparked("SideOfPier", c)?;
            if side == PierSide::Unknown {
                return Err(DeviceError::invalid_value("SideOfPier cannot be set to pierUnknown"));
            }
            let duration = c.slew_duration();
            s.start_motion(Goal::Flip(side), duration);
            Ok(duration)
        })?;
        self.settle(duration).await;
        Ok(())
    }

    async fn sidereal_time(&self) -> DeviceResult<f64> {
        self.with_state("SiderealTime", |s, _| Ok(s.lst()))
    }

    async fn site_elevation(&self) -> DeviceResult<f64> {
        self.with_state("SiteElevation", |s, _| Ok(s.elevation))
    }

    async fn set_site_elevation(&self, elevation: f64) -> DeviceResult<()> {
        self.with_state("SiteElevation", |s, c| {
            if !c.faults.accept_out_of_range_site && !(-300.0..=10_000.0).contains(&elevation) {
                return Err(DeviceError::invalid_value(format!("Site elevation {} is out of range", elevation)));
            }
            s.elevation = elevation;
            Ok(())
        })
    }

    async fn site_latitude(&self) -> DeviceResult<f64> {
        self.with_state("SiteLatitude", |s, _| Ok(s.latitude))
    }

    async fn set_site_latitude(&self, latitude: f64) -> DeviceResult<()> {
        self.with_state("SiteLatitude", |s, c| {
            if !c.faults.accept_out_of_range_site && !(-90.0..=90.0).contains(&latitude) {
                return Err(DeviceError::invalid_value(format!("Site latitude {} is out of range", latitude)));
            }
            s.latitude = latitude;
            Ok(())
        })
    }

    async fn site_longitude(&self) -> DeviceResult<f64> {
        self.with_state("SiteLongitude", |s, _| Ok(s.longitude))
    }

    async fn set_site_longitude(&self, longitude: f64) -> DeviceResult<()> {
        self.with_state("SiteLongitude", |s, c| {
            if !c.faults.accept_out_of_range_site && !(-180.0..=180.0).contains(&longitude) {
                return Err(DeviceError::invalid_value(format!("Site longitude {} is out of range", longitude)));
            }
            s.longitude = longitude;
            Ok(())
        })
    }

    async fn slewing(&self) -> DeviceResult<bool> {
        self.with_state("Slewing", |s, c| Ok(!c.faults.slewing_never_set && s.slewing()))
    }

    async fn slew_settle_time(&self) -> DeviceResult<i16> {
        self.with_state("SlewSettleTime", |s, _| Ok(s.slew_settle_time))
    }

    async fn set_slew_settle_time(&self, seconds: i16) -> DeviceResult<()> {
        self.with_state("SlewSettleTime", |s, _| {
            if seconds < 0 {
                return Err(DeviceError::invalid_value(format!("Slew settle time {} is negative", seconds)));
            }
            s.slew_settle_time = seconds;
            Ok(())
        })
    }

    async fn target_declination(&self) -> DeviceResult<f64> {
        self.with_state("TargetDeclination", |s, _| {
            s.target_dec
                .ok_or_else(|| DeviceError::new(ErrorKind::ValueNotSet, "TargetDeclination has not been set"))
        })
    }

    async fn set_target_declination(&self, dec: f64) -> DeviceResult<()> {
        self.with_state("TargetDeclination", |s, _| {
            if !(-90.0..=90.0).contains(&dec) {
                return Err(DeviceError::invalid_value(format!("Target declination {} is out of range", dec)));
            }
            s.target_dec = Some(dec);
            Ok(())
        })
    }

    async fn target_right_ascension(&self) -> DeviceResult<f64> {
        self.with_state("TargetRightAscension", |s, _| {
            s.target_ra
                .ok_or_else(|| DeviceError::new(ErrorKind::ValueNotSet, "TargetRightAscension has not been set"))
        })
    }

    async fn set_target_right_ascension(&self, ra: f64) -> DeviceResult<()> {
        self.with_state("TargetRightAscension", |s, _| {
            if !(0.0..24.0).contains(&ra) {
                return Err(DeviceError::invalid_value(format!("Target right ascension {} is out of range", ra)));
            }
            s.target_ra = Some(ra);
            Ok(())
        })
    }

    async fn tracking(&self) -> DeviceResult<bool> {
        self.with_state("Tracking", |s, _| Ok(s.tracking))
    }

    async fn set_tracking(&self, tracking: bool) -> DeviceResult<()> {
        self.with_state("Tracking", |s, c| {
            if !c.capabilities.can_set_tracking {
                return Self::not_implemented("Tracking write");
            }
            s.tracking = tracking;
            Ok(())
        })
    }

    async fn tracking_rate(&self) -> DeviceResult<DriveRate> {
        self.with_state("TrackingRate", |s, _| Ok(s.tracking_rate))
    }

    async fn set_tracking_rate(&self, rate: DriveRate) -> DeviceResult<()> {
        self.with_state("TrackingRate", |s, _| {
            if rate != DriveRate::Sidereal {
                s.ra_rate = 0.0;
                s.dec_rate = 0.0;
            }
            s.tracking_rate = rate;
            Ok(())
        })
    }

    async fn tracking_rates(&self) -> DeviceResult<Vec<DriveRate>> {
        self.with_state("TrackingRates", |_, _| Ok(DriveRate::ALL.to_vec()))
    }

    async fn utc_date(&self) -> DeviceResult<DateTime<Utc>> {
        self.with_state("UTCDate", |s, _| Ok(Utc::now() + s.utc_offset))
    }

    async fn set_utc_date(&self, date: DateTime<Utc>) -> DeviceResult<()> {
        self.with_state("UTCDate", |s, _| {
            s.utc_offset = date - Utc::now();
            Ok(())
        })
    }

    // =========================================================================
    // METHODS
    // =========================================================================

    async fn abort_slew(&self) -> DeviceResult<()> {
        self.with_state("AbortSlew", |s, _| {
            s.motion = None;
            s.axis_rates = [0.0; 3];
            Ok(())
        })
    }

    async fn axis_rates(&self, axis: TelescopeAxis) -> DeviceResult<Vec<AxisRate>> {
        self.with_state("AxisRates", |_, c| {
            if c.capabilities.can_move_axis[axis.index()] {
                Ok(vec![AxisRate {
                    minimum: 0.0,
                    maximum: MAX_AXIS_RATE,
                }])
            } else {
                Ok(Vec::new())
            }
        })
    }

    async fn destination_side_of_pier(&self, ra: f64, dec: f64) -> DeviceResult<PierSide> {
        self.with_state("DestinationSideOfPier", |s, c| {
            MountState::validate_equatorial(ra, dec)?;
            let ha = angles::hour_angle(s.lst(), ra);
            Ok(s.reported_side(side_for_hour_angle(ha), ha, c))
        })
    }

    async fn find_home(&self) -> DeviceResult<()> {
        let duration = self.with_state("FindHome", |s, c| {
            if !c.capabilities.can_find_home {
                return Self::not_implemented("FindHome");
            }
            s.ensure_unparked("FindHome", c)?;
            let duration = c.slew_duration();
            s.start_motion(Goal::Home, duration);
            Ok(duration)
        })?;
        self.settle(duration).await;
        Ok(())
    }

    async fn move_axis(&self, axis: TelescopeAxis, rate: f64) -> DeviceResult<()> {
        self.with_state("MoveAxis", |s, c| {
            if !c.capabilities.can_move_axis[axis.index()] {
                return Self::not_implemented("MoveAxis");
            }
            s.ensure_unparked("MoveAxis", c)?;
            if rate.abs() > MAX_AXIS_RATE {
                return Err(DeviceError::invalid_value(format!(
                    "Rate {} is outside the supported range for the {} axis",
                    rate, axis
                )));
            }
            if rate != 0.0 {
                s.at_home = false;
            }
            s.axis_rates[axis.index()] = rate;
            Ok(())
        })
    }

    async fn park(&self) -> DeviceResult<()> {
        let duration = self.with_state("Park", |s, c| {
            if !c.capabilities.can_park {
                return Self::not_implemented("Park");
            }
            if s.at_park {
                return Ok(Duration::ZERO);
            }
            s.axis_rates = [0.0; 3];
            let duration = c.slew_duration();
            s.start_motion(Goal::Park, duration);
            Ok(duration)
        })?;
        self.settle(duration).await;
        Ok(())
    }

    async fn pulse_guide(&self, direction: GuideDirection, duration_ms: i32) -> DeviceResult<()> {
        self.with_state("PulseGuide", |s, c| {
            if !c.capabilities.can_pulse_guide {
                return Self::not_implemented("PulseGuide");
            }
            s.ensure_unparked("PulseGuide", c)?;
            if duration_ms < 0 {
                return Err(DeviceError::invalid_value(format!("Pulse duration {} is negative", duration_ms)));
            }
            let start = Instant::now();
            let pulse = Pulse {
                direction,
                start,
                end: start + Duration::from_millis(duration_ms as u64),
            };
            match direction {
                GuideDirection::North | GuideDirection::South => s.dec_pulse = Some(pulse),
                GuideDirection::East | GuideDirection::West => s.ra_pulse = Some(pulse),
            }
            Ok(())
        })
    }

    async fn set_park(&self) -> DeviceResult<()> {
        self.with_state("SetPark", |s, c| {
            if !c.capabilities.can_set_park {
                return Self::not_implemented("SetPark");
            }
            s.park_position = s.horizontal();
            Ok(())
        })
    }

    async fn slew_to_alt_az(&self, altitude: f64, azimuth: f64) -> DeviceResult<()> {
        let duration = self.with_state("SlewToAltAz", |s, c| {
            if !c.capabilities.can_slew_alt_az {
                return Self::not_implemented("SlewToAltAz");
            }
            s.start_horizontal_slew(c, "SlewToAltAz", altitude, azimuth)
        })?;
        self.settle(duration).await;
        Ok(())
    }

    async fn slew_to_alt_az_async(&self, altitude: f64, azimuth: f64) -> DeviceResult<()> {
        self.with_state("SlewToAltAzAsync", |s, c| {
            if !c.capabilities.can_slew_alt_az_async {
                return Self::not_implemented("SlewToAltAzAsync");
            }
            s.start_horizontal_slew(c, "SlewToAltAzAsync", altitude, azimuth).map(|_| ())
        })
    }

    async fn slew_to_coordinates(&self, ra: f64, dec: f64) -> DeviceResult<()> {
        let duration = self.with_state("SlewToCoordinates", |s, c| {
            if !c.capabilities.can_slew {
                return Self::not_implemented("SlewToCoordinates");
            }
            s.start_equatorial_slew(c, "SlewToCoordinates", ra, dec)
        })?;
        self.settle(duration).await;
        Ok(())
    }

    async fn slew_to_coordinates_async(&self, ra: f64, dec: f64) -> DeviceResult<()> {
        self.with_state("SlewToCoordinatesAsync", |s, c| {
            if !c.capabilities.can_slew_async {
                return Self::not_implemented("SlewToCoordinatesAsync");
            }
            s.start_equatorial_slew(c, "SlewToCoordinatesAsync", ra, dec).map(|_| ())
        })
    }

    async fn slew_to_target(&self) -> DeviceResult<()> {
        let duration = self.with_state("SlewToTarget", |s, c| {
            if !c.capabilities.can_slew {
                return Self::not_implemented("SlewToTarget");
            }
            let (ra, dec) = s.target("SlewToTarget")?;
            s.start_equatorial_slew(c, "SlewToTarget", ra, dec)
        })?;
        self.settle(duration).await;
        Ok(())
    }

    async fn slew_to_target_async(&self) -> DeviceResult<()> {
        self.with_state("SlewToTargetAsync", |s, c| {
            if !c.capabilities.can_slew_async {
                return Self::not_implemented("SlewToTargetAsync");
            }
            let (ra, dec) = s.target("SlewToTargetAsync")?;
            s.start_equatorial_slew(c, "SlewToTargetAsync", ra, dec).map(|_| ())
        })
    }

    async fn sync_to_alt_az(&self, altitude: f64, azimuth: f64) -> DeviceResult<()> {
        self.with_state("SyncToAltAz", |s, c| {
            if !c.capabilities.can_sync_alt_az {
                return Self::not_implemented("SyncToAltAz");
            }
            s.ensure_unparked("SyncToAltAz", c)?;
            MountState::validate_horizontal(altitude, azimuth)?;
            s.require_tracking("SyncToAltAz", false)?;
            s.place_horizontal(altitude, azimuth, Instant::now());
            Ok(())
        })
    }

    async fn sync_to_coordinates(&self, ra: f64, dec: f64) -> DeviceResult<()> {
        self.with_state("SyncToCoordinates", |s, c| {
            if !c.capabilities.can_sync {
                return Self::not_implemented("SyncToCoordinates");
            }
            s.ensure_unparked("SyncToCoordinates", c)?;
            MountState::validate_equatorial(ra, dec)?;
            s.require_tracking("SyncToCoordinates", true)?;
            s.ra = ra;
            s.dec = dec;
            s.target_ra = Some(ra);
            s.target_dec = Some(dec);
            Ok(())
        })
    }

    async fn sync_to_target(&self) -> DeviceResult<()> {
        self.with_state("SyncToTarget", |s, c| {
            if !c.capabilities.can_sync {
                return Self::not_implemented("SyncToTarget");
            }
            s.ensure_unparked("SyncToTarget", c)?;
            let (ra, dec) = s.target("SyncToTarget")?;
            s.require_tracking("SyncToTarget", true)?;
            s.ra = ra;
            s.dec = dec;
            Ok(())
        })
    }

    async fn unpark(&self) -> DeviceResult<()> {
        self.with_state("Unpark", |s, c| {
            if !c.capabilities.can_unpark {
                return Self::not_implemented("Unpark");
            }
            s.at_park = false;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> SimulatorConfig {
        SimulatorConfig {
            slew_duration_ms: 20,
            ..SimulatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_async_slew_reports_slewing_then_arrives() {
        let scope = SimulatedTelescope::new(fast());
        scope.set_tracking(true).await.unwrap();
        let lst = scope.sidereal_time().await.unwrap();
        let ra = angles::ra_at_hour_angle(lst, 2.0);

        scope.slew_to_coordinates_async(ra, 2.0).await.unwrap();
        assert!(scope.slewing().await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!scope.slewing().await.unwrap());
        assert!(angles::ra_difference_arcsec(scope.right_ascension().await.unwrap(), ra).abs() < 1.0);
        assert!((scope.declination().await.unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(scope.target_right_ascension().await.unwrap(), ra);
    }

    #[tokio::test]
    async fn test_equatorial_slew_requires_tracking() {
        let scope = SimulatedTelescope::new(fast());
        let err = scope.slew_to_coordinates(1.0, 10.0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidOperation);
    }

    #[tokio::test]
    async fn test_out_of_range_coordinates_are_invalid_values() {
        let scope = SimulatedTelescope::new(fast());
        scope.set_tracking(true).await.unwrap();
        assert_eq!(scope.slew_to_coordinates(25.0, 0.0).await.unwrap_err().kind, ErrorKind::InvalidValue);
        assert_eq!(scope.sync_to_coordinates(1.0, 100.0).await.unwrap_err().kind, ErrorKind::InvalidValue);
        assert_eq!(scope.set_site_elevation(-301.0).await.unwrap_err().kind, ErrorKind::InvalidValue);
    }

    #[tokio::test]
    async fn test_untracked_mount_holds_alt_az() {
        let scope = SimulatedTelescope::new(fast());
        scope.slew_to_alt_az(50.0, 150.0).await.unwrap();
        let alt = scope.altitude().await.unwrap();
        let ra = scope.right_ascension().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!((scope.altitude().await.unwrap() - alt).abs() < 1e-4);
        assert!((alt - 50.0).abs() < 1e-3);
        assert!(angles::ra_difference_hours(scope.right_ascension().await.unwrap(), ra) > 0.0);
    }

    #[tokio::test]
    async fn test_parked_mount_rejects_motion() {
        let scope = SimulatedTelescope::new(fast());
        scope.park().await.unwrap();
        assert!(scope.at_park().await.unwrap());
        assert!(!scope.tracking().await.unwrap());

        let err = scope.move_axis(TelescopeAxis::Primary, 0.0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidWhileParked);
        assert!(scope.at_park().await.unwrap());

        scope.park().await.unwrap();
        scope.unpark().await.unwrap();
        assert!(!scope.at_park().await.unwrap());
    }

    #[tokio::test]
    async fn test_generic_parked_fault() {
        let mut config = fast();
        config.faults.generic_parked_error = true;
        let scope = SimulatedTelescope::new(config);
        scope.park().await.unwrap();
        assert_eq!(scope.find_home().await.unwrap_err().kind, ErrorKind::Other);
    }

    #[tokio::test]
    async fn test_pulse_guide_moves_declination() {
        let scope = SimulatedTelescope::new(fast());
        scope.set_tracking(true).await.unwrap();
        scope.set_guide_rate_declination(0.01).await.unwrap();
        let start = scope.declination().await.unwrap();

        scope.pulse_guide(GuideDirection::North, 100).await.unwrap();
        assert!(scope.is_pulse_guiding().await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!scope.is_pulse_guiding().await.unwrap());

        let moved = scope.declination().await.unwrap() - start;
        assert!((moved - 0.001).abs() < 1e-9, "moved {}", moved);
    }

    #[tokio::test]
    async fn test_ignored_pulse_keeps_position() {
        let mut config = fast();
        config.faults.pulse_guide_ignored = true;
        let scope = SimulatedTelescope::new(config);
        scope.set_tracking(true).await.unwrap();
        let start = scope.declination().await.unwrap();

        scope.pulse_guide(GuideDirection::North, 50).await.unwrap();
        assert!(scope.is_pulse_guiding().await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(!scope.is_pulse_guiding().await.unwrap());
        assert_eq!(scope.declination().await.unwrap(), start);
    }

    #[tokio::test]
    async fn test_offsets_are_zero_under_non_sidereal_rate() {
        let scope = SimulatedTelescope::new(fast());
        scope.set_right_ascension_rate(0.1).await.unwrap();
        scope.set_tracking_rate(DriveRate::Lunar).await.unwrap();
        assert_eq!(scope.right_ascension_rate().await.unwrap(), 0.0);
        assert_eq!(
            scope.set_declination_rate(1.0).await.unwrap_err().kind,
            ErrorKind::InvalidOperation
        );
    }

    #[tokio::test]
    async fn test_pier_side_follows_hour_angle() {
        let scope = SimulatedTelescope::new(fast());
        scope.set_tracking(true).await.unwrap();
        let lst = scope.sidereal_time().await.unwrap();

        scope.slew_to_coordinates(angles::ra_at_hour_angle(lst, -3.0), 30.0).await.unwrap();
        assert_eq!(scope.side_of_pier().await.unwrap(), PierSide::West);
        scope.slew_to_coordinates(angles::ra_at_hour_angle(lst, 3.0), 30.0).await.unwrap();
        assert_eq!(scope.side_of_pier().await.unwrap(), PierSide::East);
    }

    #[tokio::test]
    async fn test_failing_member_fault() {
        let mut config = fast();
        config.faults.failing_members.push("Altitude".to_string());
        let scope = SimulatedTelescope::new(config);
        assert_eq!(scope.altitude().await.unwrap_err().kind, ErrorKind::Other);
        assert!(scope.azimuth().await.is_ok());
    }

    #[tokio::test]
    async fn test_targets_start_unset() {
        let scope = SimulatedTelescope::new(fast());
        assert_eq!(scope.target_declination().await.unwrap_err().kind, ErrorKind::ValueNotSet);
    }
}
