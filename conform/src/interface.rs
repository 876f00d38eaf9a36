//! Interface generation descriptor
//!
//! The telescope interface has been revised several times. Rather than
//! checking version numbers throughout the engine, the differences that
//! matter to the tests are captured once here as data.

use crate::device::ErrorKind;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterfaceGeneration {
    V1,
    V2,
    V3,
    V4,
}

impl fmt::Display for InterfaceGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceGeneration::V1 => write!(f, "ITelescopeV1"),
            InterfaceGeneration::V2 => write!(f, "ITelescopeV2"),
            InterfaceGeneration::V3 => write!(f, "ITelescopeV3"),
            InterfaceGeneration::V4 => write!(f, "ITelescopeV4"),
        }
    }
}

/// What a motion member must throw while the mount is parked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkedRejection {
    /// Any error is accepted
    AnyError,
    /// Only this kind is accepted
    Exactly(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceProfile {
    pub version: i16,
    pub generation: InterfaceGeneration,
    /// Capability getters must not throw
    pub capability_getters_mandatory: bool,
    /// CanMoveAxis, AxisRates and MoveAxis exist
    pub has_axis_members: bool,
    pub has_destination_side_of_pier: bool,
    /// TrackingRates exists and must list Sidereal
    pub has_tracking_rates: bool,
    pub has_equatorial_system: bool,
    /// CanSlew/CanSlewAsync and CanSlewAltAz/CanSlewAltAzAsync must agree
    pub slew_flags_must_pair: bool,
    pub parked_rejection: ParkedRejection,
    /// Rate offsets read zero and reject writes unless tracking at sidereal rate
    pub offsets_require_sidereal: bool,
}

impl InterfaceProfile {
    pub fn from_version(version: i16) -> Self {
        let generation = match version {
            i16::MIN..=1 => InterfaceGeneration::V1,
            2 => InterfaceGeneration::V2,
            3 => InterfaceGeneration::V3,
            _ => InterfaceGeneration::V4,
        };
        let v2 = generation >= InterfaceGeneration::V2;
        let v4 = generation >= InterfaceGeneration::V4;

        Self {
            version,
            generation,
            capability_getters_mandatory: v2,
            has_axis_members: v2,
            has_destination_side_of_pier: v2,
            has_tracking_rates: v2,
            has_equatorial_system: v2,
            slew_flags_must_pair: v4,
            parked_rejection: if v4 {
                ParkedRejection::Exactly(ErrorKind::InvalidWhileParked)
            } else {
                ParkedRejection::AnyError
            },
            offsets_require_sidereal: v4,
        }
    }

    /// Whether a device error satisfies the parked rule for this generation
    pub fn accepts_parked_error(&self, kind: ErrorKind) -> bool {
        match self.parked_rejection {
            ParkedRejection::AnyError => true,
            ParkedRejection::Exactly(expected) => kind == expected,
        }
    }
}

impl Default for InterfaceProfile {
    fn default() -> Self {
        Self::from_version(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_is_lenient() {
        let profile = InterfaceProfile::from_version(1);
        assert_eq!(profile.generation, InterfaceGeneration::V1);
        assert!(!profile.capability_getters_mandatory);
        assert!(!profile.has_axis_members);
        assert!(profile.accepts_parked_error(ErrorKind::Other));
    }

    #[test]
    fn test_v3_has_axis_members_but_no_pairing() {
        let profile = InterfaceProfile::from_version(3);
        assert!(profile.has_axis_members);
        assert!(profile.capability_getters_mandatory);
        assert!(!profile.slew_flags_must_pair);
        assert!(!profile.offsets_require_sidereal);
        assert!(profile.accepts_parked_error(ErrorKind::InvalidOperation));
    }

    #[test]
    fn test_v4_tightens_contract() {
        let profile = InterfaceProfile::from_version(4);
        assert!(profile.slew_flags_must_pair);
        assert!(profile.offsets_require_sidereal);
        assert!(profile.accepts_parked_error(ErrorKind::InvalidWhileParked));
        assert!(!profile.accepts_parked_error(ErrorKind::InvalidOperation));
    }

    #[test]
    fn test_future_versions_use_newest_rules() {
        assert_eq!(InterfaceProfile::from_version(7).generation, InterfaceGeneration::V4);
        assert_eq!(InterfaceProfile::from_version(0).generation, InterfaceGeneration::V1);
    }
}
