//! Core coordination engine of a Centralized Traffic Control office for a
//! multi-line light-rail network. Owns the authoritative model of trains,
//! blocks, routes and wayside controllers, consumes field telemetry and
//! emits block-scoped movement commands back to the wayside.

pub mod comm;
pub mod error;
pub mod events;
pub mod failure;
pub mod kernel;
pub mod routing;
pub mod state;
pub mod system;
pub mod testing;
pub mod wayside;

pub use comm::CommunicationCore;
pub use error::{BlockClosureConflict, CtcError, ProtocolViolation, RouteInfeasible};
pub use events::{CtcEvent, EventBus, Warning, WarningKind};
pub use failure::{EmergencyKind, EmergencyRecord, FailureManager, RerouteOutcome};
pub use routing::RouteManager;
pub use state::CtcState;
pub use system::{Conflict, ConflictKind, ConflictSeverity, CtcSystem};
pub use wayside::{
    ControllerId, FieldKind, TrainCommands, WaysideController, WaysideRegistry,
};
