//! Telescope Conformance Engine
//!
//! Exercises every member of a telescope driver and reports, member by
//! member, whether it behaves as the interface requires. The engine talks to
//! the device through the [`Telescope`] trait, so any transport can be tested
//! by implementing it; [`SimulatedTelescope`] is an in-process implementation.

pub mod angles;
pub mod capabilities;
pub mod classify;
pub mod config;
pub mod device;
pub mod error;
pub mod interface;
pub mod methods;
pub mod performance;
pub mod pier_side;
pub mod properties;
pub mod rate_offset;
pub mod report;
pub mod session;
pub mod simulator;
pub mod slew;
pub mod targets;
pub mod tester;
pub mod waiter;

pub use capabilities::{Capability, CapabilityRegistry};
pub use classify::{Requirement, Verdict};
pub use config::{MethodTests, TelescopeSettings};
pub use device::{
    AlignmentMode, AxisRate, DeviceError, DeviceResult, DriveRate, EquatorialSystem, ErrorKind, GuideDirection,
    PierSide, PointingState, Telescope, TelescopeAxis,
};
pub use error::{ConformError, ConformResult};
pub use interface::{InterfaceGeneration, InterfaceProfile};
pub use report::{Outcome, OutcomeCounts, OutcomeRecord, RecordingReporter, Reporter, RunSummary, TracingReporter};
pub use session::{RunContext, TestSession};
pub use simulator::{SimulatedTelescope, SimulatorCapabilities, SimulatorConfig, SimulatorFaults};
pub use tester::{ConformanceTester, RunPhase, TesterEvent};
