//! Telescope Device Contract
//!
//! Defines the members the conformance engine expects from a telescope/mount,
//! independent of how the device is reached. Transport adapters implement
//! [`Telescope`] and normalize every failure into a [`DeviceError`] carrying an
//! [`ErrorKind`], so the rest of the engine never sees transport-specific codes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Result type for device calls
pub type DeviceResult<T> = Result<T, DeviceError>;

// =============================================================================
// ERRORS
// =============================================================================

/// Normalized category of a device failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The member is not implemented by this device
    NotImplemented,
    /// A supplied value is outside the member's legal range
    InvalidValue,
    /// The member cannot be used in the device's current state
    InvalidOperation,
    /// The member is refused because the mount is parked
    InvalidWhileParked,
    /// A value was read before it was ever set
    ValueNotSet,
    /// The device is not connected
    NotConnected,
    /// Anything else, including transport failures
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotImplemented => "NotImplemented",
            ErrorKind::InvalidValue => "InvalidValue",
            ErrorKind::InvalidOperation => "InvalidOperation",
            ErrorKind::InvalidWhileParked => "InvalidWhileParked",
            ErrorKind::ValueNotSet => "ValueNotSet",
            ErrorKind::NotConnected => "NotConnected",
            ErrorKind::Other => "Other",
        }
    }

    /// Alpaca error number used to signal this kind on the wire
    pub fn alpaca_code(&self) -> i32 {
        match self {
            ErrorKind::NotImplemented => 0x400,
            ErrorKind::InvalidValue => 0x401,
            ErrorKind::ValueNotSet => 0x402,
            ErrorKind::NotConnected => 0x407,
            ErrorKind::InvalidWhileParked => 0x408,
            ErrorKind::InvalidOperation => 0x40B,
            ErrorKind::Other => 0x500,
        }
    }

    /// Map an ASCOM error number to a kind.
    ///
    /// Accepts the Alpaca numbering (0x400..0x4FF), the COM HRESULT form of the
    /// same numbers (0x80040400..) and the handful of generic .NET HRESULTs that
    /// older COM drivers raise instead of the ASCOM exception types.
    pub fn from_ascom_code(code: i32) -> Self {
        let raw = code as u32;
        let code = if raw & 0xFFFF_F000 == 0x8004_0000 {
            (raw & 0xFFF) as i32
        } else {
            code
        };

        match code as u32 {
            0x400 | 0x40C => ErrorKind::NotImplemented,
            0x401 => ErrorKind::InvalidValue,
            0x402 => ErrorKind::ValueNotSet,
            0x407 => ErrorKind::NotConnected,
            0x408 => ErrorKind::InvalidWhileParked,
            0x40B => ErrorKind::InvalidOperation,
            // E_NOTIMPL
            0x8000_4001 => ErrorKind::NotImplemented,
            // E_INVALIDARG / COR_E_ARGUMENTOUTOFRANGE
            0x8007_0057 | 0x8013_1502 => ErrorKind::InvalidValue,
            // COR_E_INVALIDOPERATION
            0x8013_1509 => ErrorKind::InvalidOperation,
            _ => ErrorKind::Other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failure reported by (or on the way to) the device
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct DeviceError {
    pub kind: ErrorKind,
    /// Raw transport code, when the adapter had one
    pub code: Option<i32>,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Build an error from a raw ASCOM error number
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_ascom_code(code),
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn not_implemented(member: &str) -> Self {
        Self::new(ErrorKind::NotImplemented, format!("{} is not implemented", member))
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidValue, message)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOperation, message)
    }

    pub fn parked(member: &str) -> Self {
        Self::new(
            ErrorKind::InvalidWhileParked,
            format!("{} is not allowed while the mount is parked", member),
        )
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

// =============================================================================
// ENUMERATIONS
// =============================================================================

/// Pier side as reported by SideOfPier / DestinationSideOfPier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PierSide {
    East = 0,
    West = 1,
    Unknown = -1,
}

impl PierSide {
    pub fn from_raw(value: i32) -> Self {
        match value {
            0 => PierSide::East,
            1 => PierSide::West,
            _ => PierSide::Unknown,
        }
    }

    /// Logical pointing state this pier side stands for.
    ///
    /// pierEast is the normal pointing state, pierWest is through the pole.
    pub fn pointing_state(&self) -> PointingState {
        match self {
            PierSide::East => PointingState::Normal,
            PierSide::West => PointingState::ThroughThePole,
            PierSide::Unknown => PointingState::Unknown,
        }
    }

    pub fn opposite(&self) -> PierSide {
        match self {
            PierSide::East => PierSide::West,
            PierSide::West => PierSide::East,
            PierSide::Unknown => PierSide::Unknown,
        }
    }
}

impl fmt::Display for PierSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PierSide::East => write!(f, "pierEast"),
            PierSide::West => write!(f, "pierWest"),
            PierSide::Unknown => write!(f, "pierUnknown"),
        }
    }
}

/// Logical pointing state of a German equatorial mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointingState {
    Normal,
    ThroughThePole,
    Unknown,
}

impl fmt::Display for PointingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointingState::Normal => write!(f, "Normal"),
            PointingState::ThroughThePole => write!(f, "Through the pole"),
            PointingState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Tracking rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveRate {
    Sidereal = 0,
    Lunar = 1,
    Solar = 2,
    King = 3,
}

impl DriveRate {
    pub const ALL: [DriveRate; 4] = [DriveRate::Sidereal, DriveRate::Lunar, DriveRate::Solar, DriveRate::King];

    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(DriveRate::Sidereal),
            1 => Some(DriveRate::Lunar),
            2 => Some(DriveRate::Solar),
            3 => Some(DriveRate::King),
            _ => None,
        }
    }
}

impl fmt::Display for DriveRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveRate::Sidereal => write!(f, "Sidereal"),
            DriveRate::Lunar => write!(f, "Lunar"),
            DriveRate::Solar => write!(f, "Solar"),
            DriveRate::King => write!(f, "King"),
        }
    }
}

/// Mount geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlignmentMode {
    AltAz = 0,
    Polar = 1,
    GermanPolar = 2,
}

impl AlignmentMode {
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(AlignmentMode::AltAz),
            1 => Some(AlignmentMode::Polar),
            2 => Some(AlignmentMode::GermanPolar),
            _ => None,
        }
    }
}

impl fmt::Display for AlignmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentMode::AltAz => write!(f, "AltAz"),
            AlignmentMode::Polar => write!(f, "Polar"),
            AlignmentMode::GermanPolar => write!(f, "German Polar"),
        }
    }
}

/// Equatorial coordinate system used by the mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EquatorialSystem {
    Other = 0,
    Topocentric = 1,
    J2000 = 2,
    J2050 = 3,
    B1950 = 4,
}

impl EquatorialSystem {
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(EquatorialSystem::Other),
            1 => Some(EquatorialSystem::Topocentric),
            2 => Some(EquatorialSystem::J2000),
            3 => Some(EquatorialSystem::J2050),
            4 => Some(EquatorialSystem::B1950),
            _ => None,
        }
    }
}

impl fmt::Display for EquatorialSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EquatorialSystem::Other => write!(f, "Other"),
            EquatorialSystem::Topocentric => write!(f, "Topocentric"),
            EquatorialSystem::J2000 => write!(f, "J2000"),
            EquatorialSystem::J2050 => write!(f, "J2050"),
            EquatorialSystem::B1950 => write!(f, "B1950"),
        }
    }
}

/// Pulse guide direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuideDirection {
    North = 0,
    South = 1,
    East = 2,
    West = 3,
}

impl GuideDirection {
    pub const ALL: [GuideDirection; 4] = [
        GuideDirection::North,
        GuideDirection::South,
        GuideDirection::East,
        GuideDirection::West,
    ];
}

impl fmt::Display for GuideDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuideDirection::North => write!(f, "North"),
            GuideDirection::South => write!(f, "South"),
            GuideDirection::East => write!(f, "East"),
            GuideDirection::West => write!(f, "West"),
        }
    }
}

/// Mount axis addressed by MoveAxis / AxisRates / CanMoveAxis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelescopeAxis {
    Primary = 0,
    Secondary = 1,
    Tertiary = 2,
}

impl TelescopeAxis {
    pub const ALL: [TelescopeAxis; 3] = [TelescopeAxis::Primary, TelescopeAxis::Secondary, TelescopeAxis::Tertiary];

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for TelescopeAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelescopeAxis::Primary => write!(f, "Primary"),
            TelescopeAxis::Secondary => write!(f, "Secondary"),
            TelescopeAxis::Tertiary => write!(f, "Tertiary"),
        }
    }
}

/// A supported MoveAxis rate range in degrees per second
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisRate {
    pub minimum: f64,
    pub maximum: f64,
}

impl AxisRate {
    pub fn contains(&self, rate: f64) -> bool {
        let rate = rate.abs();
        rate >= self.minimum && rate <= self.maximum
    }
}

// =============================================================================
// DEVICE TRAIT
// =============================================================================

/// Every member of the telescope interface the engine exercises.
///
/// Units follow the interface conventions: right ascension in hours,
/// declination/altitude/azimuth/site coordinates in degrees, RightAscensionRate
/// in seconds of RA per sidereal second, DeclinationRate in arcseconds per SI
/// second, guide rates in degrees per second, elevation in metres.
#[async_trait]
pub trait Telescope: Send + Sync {
    // =========================================================================
    // COMMON MEMBERS
    // =========================================================================

    async fn connected(&self) -> DeviceResult<bool>;
    async fn set_connected(&self, connected: bool) -> DeviceResult<()>;
    async fn name(&self) -> DeviceResult<String>;
    async fn description(&self) -> DeviceResult<String>;
    async fn driver_info(&self) -> DeviceResult<String>;
    async fn driver_version(&self) -> DeviceResult<String>;
    async fn interface_version(&self) -> DeviceResult<i16>;
    async fn supported_actions(&self) -> DeviceResult<Vec<String>>;

    // =========================================================================
    // CAPABILITIES
    // =========================================================================

    async fn can_find_home(&self) -> DeviceResult<bool>;
    async fn can_park(&self) -> DeviceResult<bool>;
    async fn can_pulse_guide(&self) -> DeviceResult<bool>;
    async fn can_set_declination_rate(&self) -> DeviceResult<bool>;
    async fn can_set_guide_rates(&self) -> DeviceResult<bool>;
    async fn can_set_park(&self) -> DeviceResult<bool>;
    async fn can_set_pier_side(&self) -> DeviceResult<bool>;
    async fn can_set_right_ascension_rate(&self) -> DeviceResult<bool>;
    async fn can_set_tracking(&self) -> DeviceResult<bool>;
    async fn can_slew(&self) -> DeviceResult<bool>;
    async fn can_slew_alt_az(&self) -> DeviceResult<bool>;
    async fn can_slew_alt_az_async(&self) -> DeviceResult<bool>;
    async fn can_slew_async(&self) -> DeviceResult<bool>;
    async fn can_sync(&self) -> DeviceResult<bool>;
    async fn can_sync_alt_az(&self) -> DeviceResult<bool>;
    async fn can_unpark(&self) -> DeviceResult<bool>;
    async fn can_move_axis(&self, axis: TelescopeAxis) -> DeviceResult<bool>;

    // =========================================================================
    // PROPERTIES
    // =========================================================================

    async fn alignment_mode(&self) -> DeviceResult<AlignmentMode>;
    async fn altitude(&self) -> DeviceResult<f64>;
    async fn aperture_area(&self) -> DeviceResult<f64>;
    async fn aperture_diameter(&self) -> DeviceResult<f64>;
    async fn at_home(&self) -> DeviceResult<bool>;
    async fn at_park(&self) -> DeviceResult<bool>;
    async fn azimuth(&self) -> DeviceResult<f64>;
    async fn declination(&self) -> DeviceResult<f64>;
    async fn declination_rate(&self) -> DeviceResult<f64>;
    async fn set_declination_rate(&self, rate: f64) -> DeviceResult<()>;
    async fn does_refraction(&self) -> DeviceResult<bool>;
    async fn set_does_refraction(&self, value: bool) -> DeviceResult<()>;
    async fn equatorial_system(&self) -> DeviceResult<EquatorialSystem>;
    async fn focal_length(&self) -> DeviceResult<f64>;
    async fn guide_rate_declination(&self) -> DeviceResult<f64>;
    async fn set_guide_rate_declination(&self, rate: f64) -> DeviceResult<()>;
    async fn guide_rate_right_ascension(&self) -> DeviceResult<f64>;
    async fn set_guide_rate_right_ascension(&self, rate: f64) -> DeviceResult<()>;
    async fn is_pulse_guiding(&self) -> DeviceResult<bool>;
    async fn right_ascension(&self) -> DeviceResult<f64>;
    async fn right_ascension_rate(&self) -> DeviceResult<f64>;
    async fn set_right_ascension_rate(&self, rate: f64) -> DeviceResult<()>;
    async fn side_of_pier(&self) -> DeviceResult<PierSide>;
    async fn set_side_of_pier(&self, side: PierSide) -> DeviceResult<()>;
    async fn sidereal_time(&self) -> DeviceResult<f64>;
    async fn site_elevation(&self) -> DeviceResult<f64>;
    async fn set_site_elevation(&self, elevation: f64) -> DeviceResult<()>;
    async fn site_latitude(&self) -> DeviceResult<f64>;
    async fn set_site_latitude(&self, latitude: f64) -> DeviceResult<()>;
    async fn site_longitude(&self) -> DeviceResult<f64>;
    async fn set_site_longitude(&self, longitude: f64) -> DeviceResult<()>;
    async fn slewing(&self) -> DeviceResult<bool>;
    async fn slew_settle_time(&self) -> DeviceResult<i16>;
    async fn set_slew_settle_time(&self, seconds: i16) -> DeviceResult<()>;
    async fn target_declination(&self) -> DeviceResult<f64>;
    async fn set_target_declination(&self, dec: f64) -> DeviceResult<()>;
    async fn target_right_ascension(&self) -> DeviceResult<f64>;
    async fn set_target_right_ascension(&self, ra: f64) -> DeviceResult<()>;
    async fn tracking(&self) -> DeviceResult<bool>;
    async fn set_tracking(&self, tracking: bool) -> DeviceResult<()>;
    async fn tracking_rate(&self) -> DeviceResult<DriveRate>;
    async fn set_tracking_rate(&self, rate: DriveRate) -> DeviceResult<()>;
    async fn tracking_rates(&self) -> DeviceResult<Vec<DriveRate>>;
    async fn utc_date(&self) -> DeviceResult<DateTime<Utc>>;
    async fn set_utc_date(&self, date: DateTime<Utc>) -> DeviceResult<()>;

    // =========================================================================
    // METHODS
    // =========================================================================

    async fn abort_slew(&self) -> DeviceResult<()>;
    async fn axis_rates(&self, axis: TelescopeAxis) -> DeviceResult<Vec<AxisRate>>;
    async fn destination_side_of_pier(&self, ra: f64, dec: f64) -> DeviceResult<PierSide>;
    async fn find_home(&self) -> DeviceResult<()>;
    async fn move_axis(&self, axis: TelescopeAxis, rate: f64) -> DeviceResult<()>;
    async fn park(&self) -> DeviceResult<()>;
    async fn pulse_guide(&self, direction: GuideDirection, duration_ms: i32) -> DeviceResult<()>;
    async fn set_park(&self) -> DeviceResult<()>;
    async fn slew_to_alt_az(&self, altitude: f64, azimuth: f64) -> DeviceResult<()>;
    async fn slew_to_alt_az_async(&self, altitude: f64, azimuth: f64) -> DeviceResult<()>;
    async fn slew_to_coordinates(&self, ra: f64, dec: f64) -> DeviceResult<()>;
    async fn slew_to_coordinates_async(&self, ra: f64, dec: f64) -> DeviceResult<()>;
    async fn slew_to_target(&self) -> DeviceResult<()>;
    async fn slew_to_target_async(&self) -> DeviceResult<()>;
    async fn sync_to_alt_az(&self, altitude: f64, azimuth: f64) -> DeviceResult<()>;
    async fn sync_to_coordinates(&self, ra: f64, dec: f64) -> DeviceResult<()>;
    async fn sync_to_target(&self) -> DeviceResult<()>;
    async fn unpark(&self) -> DeviceResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpaca_codes_round_trip_through_kind() {
        for kind in [
            ErrorKind::NotImplemented,
            ErrorKind::InvalidValue,
            ErrorKind::InvalidOperation,
            ErrorKind::InvalidWhileParked,
            ErrorKind::ValueNotSet,
            ErrorKind::NotConnected,
            ErrorKind::Other,
        ] {
            assert_eq!(ErrorKind::from_ascom_code(kind.alpaca_code()), kind);
        }
    }

    #[test]
    fn test_com_hresults_map_to_kinds() {
        assert_eq!(ErrorKind::from_ascom_code(0x8004_0400u32 as i32), ErrorKind::NotImplemented);
        assert_eq!(ErrorKind::from_ascom_code(0x8004_0401u32 as i32), ErrorKind::InvalidValue);
        assert_eq!(ErrorKind::from_ascom_code(0x8004_0408u32 as i32), ErrorKind::InvalidWhileParked);
        assert_eq!(ErrorKind::from_ascom_code(0x8004_040Bu32 as i32), ErrorKind::InvalidOperation);
        assert_eq!(ErrorKind::from_ascom_code(0x8000_4001u32 as i32), ErrorKind::NotImplemented);
        assert_eq!(ErrorKind::from_ascom_code(0x8013_1509u32 as i32), ErrorKind::InvalidOperation);
        assert_eq!(ErrorKind::from_ascom_code(0x8007_0057u32 as i32), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_action_not_implemented_counts_as_not_implemented() {
        assert_eq!(ErrorKind::from_ascom_code(0x40C), ErrorKind::NotImplemented);
    }

    #[test]
    fn test_driver_specific_codes_are_other() {
        assert_eq!(ErrorKind::from_ascom_code(0x500), ErrorKind::Other);
        assert_eq!(ErrorKind::from_ascom_code(0xFFF), ErrorKind::Other);
        assert_eq!(ErrorKind::from_ascom_code(-1), ErrorKind::Other);
    }

    #[test]
    fn test_device_error_display() {
        let err = DeviceError::from_code(0x401, "Latitude -91 is out of range");
        assert_eq!(err.kind, ErrorKind::InvalidValue);
        assert_eq!(err.code, Some(0x401));
        assert_eq!(err.to_string(), "InvalidValue: Latitude -91 is out of range");
    }

    #[test]
    fn test_pier_side_pointing_state() {
        assert_eq!(PierSide::East.pointing_state(), PointingState::Normal);
        assert_eq!(PierSide::West.pointing_state(), PointingState::ThroughThePole);
        assert_eq!(PierSide::Unknown.pointing_state(), PointingState::Unknown);
        assert_eq!(PierSide::East.opposite(), PierSide::West);
        assert_eq!(PierSide::from_raw(7), PierSide::Unknown);
    }

    #[test]
    fn test_axis_rate_contains_uses_magnitude() {
        let rate = AxisRate { minimum: 0.0, maximum: 4.0 };
        assert!(rate.contains(2.0));
        assert!(rate.contains(-4.0));
        assert!(!rate.contains(4.5));
    }

    #[test]
    fn test_raw_enum_conversions() {
        assert_eq!(DriveRate::from_raw(2), Some(DriveRate::Solar));
        assert_eq!(DriveRate::from_raw(9), None);
        assert_eq!(AlignmentMode::from_raw(2), Some(AlignmentMode::GermanPolar));
        assert_eq!(EquatorialSystem::from_raw(1), Some(EquatorialSystem::Topocentric));
        assert_eq!(EquatorialSystem::from_raw(5), None);
    }
}
