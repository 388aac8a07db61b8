use serde::{Deserialize, Serialize};

pub mod block;
pub mod closure;
pub mod route;
pub mod train;

pub use block::{Block, BlockStateError, OccupancyTransition, SwitchPosition};
pub use closure::{Closure, ClosureId, ClosureStatus, Opening};
pub use route::{AdvanceOutcome, Route, RouteCreateError, RouteId};
pub use train::{RoutingStatus, Train, TrainId, TrainIdError};

/// Movement authority for one block: a train may enter (1) or may not (0).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum Authority {
    #[default]
    Denied,
    Granted,
}

impl Authority {
    pub fn as_u8(&self) -> u8 {
        match self {
            Authority::Denied => 0,
            Authority::Granted => 1,
        }
    }

    pub fn granted(&self) -> bool {
        matches!(self, Authority::Granted)
    }
}

/// Suggested speed command. Fractions are of the block's speed limit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum SpeedCommand {
    #[default]
    Stop,
    OneThird,
    TwoThirds,
    Full,
}

impl SpeedCommand {
    pub fn as_u8(&self) -> u8 {
        match self {
            SpeedCommand::Stop => 0,
            SpeedCommand::OneThird => 1,
            SpeedCommand::TwoThirds => 2,
            SpeedCommand::Full => 3,
        }
    }

    /// Effective speed in km/h for a block with the given limit.
    pub fn to_kmh(&self, speed_limit_kmh: f64) -> f64 {
        match self {
            SpeedCommand::Stop => 0.0,
            SpeedCommand::OneThird => speed_limit_kmh / 3.0,
            SpeedCommand::TwoThirds => speed_limit_kmh * 2.0 / 3.0,
            SpeedCommand::Full => speed_limit_kmh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_commands_order_by_severity() {
        // min() over constraints must pick the most restrictive command
        assert!(SpeedCommand::Stop < SpeedCommand::OneThird);
        assert!(SpeedCommand::TwoThirds < SpeedCommand::Full);
        assert_eq!(
            SpeedCommand::Full.min(SpeedCommand::OneThird),
            SpeedCommand::OneThird
        );
    }

    #[test]
    fn wire_encoding_matches_protocol() {
        assert_eq!(Authority::Denied.as_u8(), 0);
        assert_eq!(Authority::Granted.as_u8(), 1);
        assert_eq!(SpeedCommand::Stop.as_u8(), 0);
        assert_eq!(SpeedCommand::Full.as_u8(), 3);
    }
}
