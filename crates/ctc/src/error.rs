use model::{BlockStateError, TrainId, TrainIdError};
use track::{BlockNumber, Line};

use crate::wayside::{ControllerId, FieldKind};

/// A controller or inbound message broke the wayside protocol. Registration
/// propagates this to the caller; inbound updates reject the message and
/// leave all state untouched.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("controller must have a non-empty identifier")]
    MissingControllerId,
    #[error("blocks-covered mask must be a non-empty boolean array")]
    EmptyMask,
    #[error("mask length {got} does not match {line} line length {expected}")]
    MaskLengthMismatch {
        line: Line,
        expected: usize,
        got: usize,
    },
    #[error("controller {controller} covers no blocks")]
    NoCoveredBlocks { controller: ControllerId },
    #[error("controller {controller} is already registered")]
    DuplicateController { controller: ControllerId },
    #[error("block {block} on {line} is covered by both {existing} and {controller}")]
    OverlappingCoverage {
        line: Line,
        block: BlockNumber,
        existing: ControllerId,
        controller: ControllerId,
    },
    #[error("sender {0} is not a registered controller")]
    UnknownSender(ControllerId),
    #[error("{kind:?} array length {got} does not match {line} line length {expected}")]
    ArrayLengthMismatch {
        kind: FieldKind,
        line: Line,
        expected: usize,
        got: usize,
    },
}

/// The requested route can not be produced or activated.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouteInfeasible {
    #[error("no block sequence from {start} to {end} on {line}")]
    NoPath {
        line: Line,
        start: BlockNumber,
        end: BlockNumber,
    },
    #[error("route from {start} to {end} on {line} failed validation")]
    ValidationFailed {
        line: Line,
        start: BlockNumber,
        end: BlockNumber,
    },
    #[error("block {block} on {line} is already reserved")]
    BlockReserved { line: Line, block: BlockNumber },
}

/// A closure request conflicts with the current or scheduled use of the
/// block. The closure is denied and the reason returned to the dispatcher.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BlockClosureConflict {
    #[error("block {block} on {line} is currently occupied")]
    Occupied { line: Line, block: BlockNumber },
    #[error("block {block} on {line} is reserved by an active route")]
    Reserved { line: Line, block: BlockNumber },
    #[error("block {block} on {line} is already closed")]
    AlreadyClosed { line: Line, block: BlockNumber },
    #[error("block {block} on {line} already has a scheduled closure")]
    AlreadyScheduled { line: Line, block: BlockNumber },
    #[error("block {block} on {line} is not closed")]
    NotClosed { line: Line, block: BlockNumber },
}

#[derive(Debug, thiserror::Error)]
pub enum CtcError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("route infeasible: {0}")]
    Route(#[from] RouteInfeasible),
    #[error("closure denied: {0}")]
    Closure(#[from] BlockClosureConflict),
    #[error("invalid train id: {0}")]
    TrainId(#[from] TrainIdError),
    #[error("train {0} is not known to the system")]
    UnknownTrain(TrainId),
    #[error("train {0} already exists")]
    DuplicateTrain(TrainId),
    #[error("train id {id} does not belong to the {line} line")]
    TrainLineMismatch { id: TrainId, line: Line },
    #[error("block {block} does not exist on {line}")]
    UnknownBlock { line: Line, block: BlockNumber },
    #[error("train {0} has no route assigned")]
    NoRoute(TrainId),
    #[error(transparent)]
    BlockState(#[from] BlockStateError),
}
