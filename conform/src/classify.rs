//! Exception classification
//!
//! Decides whether a device's response to a call is the right one, given what
//! the call was expected to do. The rules only look at [`ErrorKind`], never at
//! transport codes.

use crate::device::{DeviceError, ErrorKind};
use crate::interface::InterfaceProfile;
use crate::report::Outcome;

/// What a member call is expected to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Devices may leave the member out
    Optional,
    /// The member must always work
    Mandatory,
    /// The named capability is true, so the member must work
    MustBeImplemented(&'static str),
    /// The named capability is false, so the member must refuse
    MustNotBeImplemented(&'static str),
}

impl Requirement {
    /// MustBeImplemented or MustNotBeImplemented depending on a capability
    pub fn from_capability(name: &'static str, enabled: bool) -> Self {
        if enabled {
            Requirement::MustBeImplemented(name)
        } else {
            Requirement::MustNotBeImplemented(name)
        }
    }

    /// Mandatory when `mandatory` holds, otherwise Optional
    pub fn mandatory_if(mandatory: bool) -> Self {
        if mandatory {
            Requirement::Mandatory
        } else {
            Requirement::Optional
        }
    }

    pub fn must_not(&self) -> bool {
        matches!(self, Requirement::MustNotBeImplemented(_))
    }
}

/// Decision about one observation
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub outcome: Outcome,
    pub message: String,
    /// Extra informational line to report after the main one
    pub detail: Option<String>,
}

impl Verdict {
    pub fn new(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Kinds that correctly signal "this member is not available"
fn is_refusal(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::NotImplemented | ErrorKind::InvalidOperation)
}

/// A call returned without error.
///
/// Only a MustNotBeImplemented call produces a verdict here; in every other
/// case the caller goes on to validate the returned value.
pub fn classify_success(member: &str, requirement: Requirement) -> Option<Verdict> {
    match requirement {
        Requirement::MustNotBeImplemented(capability) => Some(Verdict::new(
            Outcome::Issue,
            format!("{} is False but {} did not raise an error", capability, member),
        )),
        _ => None,
    }
}

/// A call raised an error
pub fn classify_error(member: &str, error: &DeviceError, requirement: Requirement) -> Verdict {
    match requirement {
        Requirement::MustNotBeImplemented(capability) if is_refusal(error.kind) => Verdict::new(
            Outcome::Ok,
            format!("{} is False and {} correctly raised {}", capability, member, error.kind),
        ),
        Requirement::MustNotBeImplemented(capability) => Verdict::new(
            Outcome::Issue,
            format!(
                "{} is False but {} raised {} instead of NotImplemented or InvalidOperation",
                capability, member, error.kind
            ),
        )
        .with_detail(format!("{} error message: {}", member, error.message)),
        Requirement::MustBeImplemented(capability) => Verdict::new(
            Outcome::Issue,
            format!("{} is True but {} raised {}", capability, member, error),
        ),
        Requirement::Mandatory => Verdict::new(
            Outcome::Issue,
            format!("{} is mandatory but raised {}", member, error),
        ),
        Requirement::Optional if error.is(ErrorKind::NotImplemented) => {
            Verdict::new(Outcome::Info, format!("{} is not implemented", member))
        }
        Requirement::Optional => Verdict::new(Outcome::Info, format!("{} raised {}", member, error)),
    }
}

/// An out-of-range value was sent and must be refused with InvalidValue
pub fn classify_invalid_value(
    member: &str,
    attempted: &str,
    result: Result<(), &DeviceError>,
    requirement: Requirement,
) -> Verdict {
    match result {
        Ok(()) => match classify_success(member, requirement) {
            Some(verdict) => verdict,
            None => Verdict::new(
                Outcome::Issue,
                format!("{} accepted the invalid value {}", member, attempted),
            ),
        },
        Err(error) if error.is(ErrorKind::InvalidValue) => Verdict::new(
            Outcome::Ok,
            format!("{} correctly rejected {} with InvalidValue", member, attempted),
        ),
        Err(error)
            if requirement.must_not()
                || (requirement == Requirement::Optional && error.is(ErrorKind::NotImplemented)) =>
        {
            classify_error(member, error, requirement)
        }
        Err(error) => Verdict::new(
            Outcome::Issue,
            format!(
                "{} rejected {} with {} instead of InvalidValue",
                member, attempted, error.kind
            ),
        )
        .with_detail(format!("{} error message: {}", member, error.message)),
    }
}

/// A motion member was called while parked and must refuse
pub fn classify_parked(member: &str, profile: &InterfaceProfile, result: Result<(), &DeviceError>) -> Verdict {
    match result {
        Ok(()) => Verdict::new(Outcome::Issue, format!("{} succeeded while the mount is parked", member)),
        Err(error) if profile.accepts_parked_error(error.kind) => Verdict::new(
            Outcome::Ok,
            format!("{} was correctly rejected while parked ({})", member, error.kind),
        ),
        Err(error) => Verdict::new(
            Outcome::Issue,
            format!(
                "{} raised {} while parked, {} requires InvalidWhileParked",
                member, error.kind, profile.generation
            ),
        )
        .with_detail(format!("{} error message: {}", member, error.message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: ErrorKind) -> DeviceError {
        DeviceError::new(kind, "boom")
    }

    #[test]
    fn test_success_only_matters_for_must_not() {
        let verdict = classify_success("FindHome", Requirement::MustNotBeImplemented("CanFindHome")).unwrap();
        assert_eq!(verdict.outcome, Outcome::Issue);
        assert!(verdict.message.contains("CanFindHome"));

        assert!(classify_success("FindHome", Requirement::MustBeImplemented("CanFindHome")).is_none());
        assert!(classify_success("Altitude", Requirement::Mandatory).is_none());
        assert!(classify_success("Altitude", Requirement::Optional).is_none());
    }

    #[test]
    fn test_must_not_accepts_refusal_kinds() {
        let req = Requirement::MustNotBeImplemented("CanPark");
        assert_eq!(classify_error("Park", &err(ErrorKind::NotImplemented), req).outcome, Outcome::Ok);
        assert_eq!(classify_error("Park", &err(ErrorKind::InvalidOperation), req).outcome, Outcome::Ok);
    }

    #[test]
    fn test_must_not_with_generic_error_is_issue_with_detail() {
        let verdict = classify_error("Park", &err(ErrorKind::Other), Requirement::MustNotBeImplemented("CanPark"));
        assert_eq!(verdict.outcome, Outcome::Issue);
        assert_eq!(verdict.detail.as_deref(), Some("Park error message: boom"));
    }

    #[test]
    fn test_required_errors_are_issues_naming_the_capability() {
        let verdict = classify_error("Park", &err(ErrorKind::Other), Requirement::MustBeImplemented("CanPark"));
        assert_eq!(verdict.outcome, Outcome::Issue);
        assert!(verdict.message.starts_with("CanPark is True"));

        let verdict = classify_error("AtPark", &err(ErrorKind::NotImplemented), Requirement::Mandatory);
        assert_eq!(verdict.outcome, Outcome::Issue);
    }

    #[test]
    fn test_optional_errors_are_info() {
        for kind in [ErrorKind::NotImplemented, ErrorKind::Other, ErrorKind::InvalidOperation] {
            assert_eq!(classify_error("FocalLength", &err(kind), Requirement::Optional).outcome, Outcome::Info);
        }
    }

    #[test]
    fn test_invalid_value_table() {
        let req = Requirement::Mandatory;
        assert_eq!(
            classify_invalid_value("SiteLatitude", "-91", Err(&err(ErrorKind::InvalidValue)), req).outcome,
            Outcome::Ok
        );
        assert_eq!(classify_invalid_value("SiteLatitude", "-91", Ok(()), req).outcome, Outcome::Issue);
        assert_eq!(
            classify_invalid_value("SiteLatitude", "-91", Err(&err(ErrorKind::InvalidOperation)), req).outcome,
            Outcome::Issue
        );
        assert_eq!(
            classify_invalid_value("SiteLatitude", "-91", Err(&err(ErrorKind::Other)), req).outcome,
            Outcome::Issue
        );
    }

    #[test]
    fn test_invalid_value_on_unsupported_member() {
        let verdict = classify_invalid_value(
            "SlewSettleTime",
            "-1",
            Err(&err(ErrorKind::NotImplemented)),
            Requirement::Optional,
        );
        assert_eq!(verdict.outcome, Outcome::Info);

        let verdict = classify_invalid_value(
            "DeclinationRate",
            "1.0",
            Err(&err(ErrorKind::NotImplemented)),
            Requirement::MustNotBeImplemented("CanSetDeclinationRate"),
        );
        assert_eq!(verdict.outcome, Outcome::Ok);
    }

    #[test]
    fn test_parked_rule_is_versioned() {
        let v3 = InterfaceProfile::from_version(3);
        let v4 = InterfaceProfile::from_version(4);
        let generic = err(ErrorKind::Other);
        let parked = err(ErrorKind::InvalidWhileParked);

        assert_eq!(classify_parked("MoveAxis", &v3, Err(&generic)).outcome, Outcome::Ok);
        assert_eq!(classify_parked("MoveAxis", &v4, Err(&generic)).outcome, Outcome::Issue);
        assert_eq!(classify_parked("MoveAxis", &v4, Err(&parked)).outcome, Outcome::Ok);
        assert_eq!(classify_parked("MoveAxis", &v4, Ok(())).outcome, Outcome::Issue);
        assert_eq!(classify_parked("MoveAxis", &v3, Ok(())).outcome, Outcome::Issue);
    }

    #[test]
    fn test_requirement_helpers() {
        assert_eq!(Requirement::from_capability("CanSync", true), Requirement::MustBeImplemented("CanSync"));
        assert!(Requirement::from_capability("CanSync", false).must_not());
        assert_eq!(Requirement::mandatory_if(false), Requirement::Optional);
    }
}
