use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use track::{BlockNumber, Line};

use crate::{route::Route, Authority, SpeedCommand};

/// Train identifier: line letter (`B`, `R`, `G`) followed by exactly three
/// decimal digits, unique system wide. `R1`, `R0001` and `X001` are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrainId {
    line: Line,
    number: u16,
}

impl TrainId {
    pub fn new(line: Line, number: u16) -> Result<Self, TrainIdError> {
        if number > 999 {
            return Err(TrainIdError::NumberOutOfRange(number));
        }
        Ok(Self { line, number })
    }

    pub fn line(&self) -> Line {
        self.line
    }

    pub fn number(&self) -> u16 {
        self.number
    }
}

impl fmt::Display for TrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:03}", self.line.letter(), self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrainIdError {
    #[error("train id must be 4 characters, got {0:?}")]
    WrongLength(String),
    #[error("train id must start with B, R or G, got {0:?}")]
    UnknownLine(char),
    #[error("train id must end in three decimal digits, got {0:?}")]
    BadNumber(String),
    #[error("train number out of range: {0}")]
    NumberOutOfRange(u16),
}

impl FromStr for TrainId {
    type Err = TrainIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let letter = match chars.next() {
            Some(c) => c,
            None => return Err(TrainIdError::WrongLength(s.to_owned())),
        };
        if s.chars().count() != 4 {
            return Err(TrainIdError::WrongLength(s.to_owned()));
        }
        let line = Line::from_letter(letter).ok_or(TrainIdError::UnknownLine(letter))?;
        let digits: String = chars.collect();
        if digits.len() != 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(TrainIdError::BadNumber(digits));
        }
        let number = digits
            .parse::<u16>()
            .map_err(|_| TrainIdError::BadNumber(digits))?;
        Ok(Self { line, number })
    }
}

impl Serialize for TrainId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TrainId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoutingStatus {
    #[default]
    Unrouted,
    Routed,
    Active,
    Stopped,
}

/// A logical mover. Thin aggregate; the interesting state lives in the
/// assigned route and the blocks.
#[derive(Debug, Clone)]
pub struct Train {
    id: TrainId,
    current_block: BlockNumber,
    route: Option<Route>,
    commanded_speed: SpeedCommand,
    authority: Authority,
    speed_kmh: f64,
    routing_status: RoutingStatus,
    departure: Option<DateTime<Utc>>,
    arrival: Option<DateTime<Utc>>,
}

impl Train {
    pub fn new(id: TrainId, current_block: BlockNumber) -> Self {
        Self {
            id,
            current_block,
            route: None,
            commanded_speed: SpeedCommand::Stop,
            authority: Authority::Denied,
            speed_kmh: 0.0,
            routing_status: RoutingStatus::Unrouted,
            departure: None,
            arrival: None,
        }
    }

    pub fn id(&self) -> &TrainId {
        &self.id
    }

    pub fn line(&self) -> Line {
        self.id.line()
    }

    pub fn current_block(&self) -> BlockNumber {
        self.current_block
    }

    pub fn set_current_block(&mut self, block: BlockNumber) {
        self.current_block = block;
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn route_mut(&mut self) -> Option<&mut Route> {
        self.route.as_mut()
    }

    pub fn take_route(&mut self) -> Option<Route> {
        self.routing_status = RoutingStatus::Unrouted;
        self.route.take()
    }

    pub fn has_active_route(&self) -> bool {
        self.route
            .as_ref()
            .map(|route| route.is_active())
            .unwrap_or(false)
    }

    /// Assigns a route and copies its schedule for display.
    pub fn assign_route(&mut self, route: Route) {
        self.departure = route.scheduled_departure();
        self.arrival = Some(route.scheduled_arrival());
        self.routing_status = RoutingStatus::Routed;
        self.route = Some(route);
    }

    pub fn routing_status(&self) -> RoutingStatus {
        self.routing_status
    }

    pub fn set_routing_status(&mut self, status: RoutingStatus) {
        self.routing_status = status;
    }

    pub fn commanded_speed(&self) -> SpeedCommand {
        self.commanded_speed
    }

    pub fn set_commanded_speed(&mut self, speed: SpeedCommand) {
        self.commanded_speed = speed;
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    pub fn set_authority(&mut self, authority: Authority) {
        self.authority = authority;
    }

    /// Actual speed as last reported from the field.
    pub fn speed_kmh(&self) -> f64 {
        self.speed_kmh
    }

    pub fn set_speed_kmh(&mut self, speed: f64) {
        self.speed_kmh = speed.max(0.0);
    }

    pub fn is_stopped(&self) -> bool {
        self.speed_kmh == 0.0
    }

    pub fn departure(&self) -> Option<DateTime<Utc>> {
        self.departure
    }

    pub fn arrival(&self) -> Option<DateTime<Utc>> {
        self.arrival
    }

    /// Next block along the assigned route, if any.
    pub fn next_block(&self) -> Option<BlockNumber> {
        let route = self.route.as_ref()?;
        let index = route.index_of(self.current_block)?;
        route.block_sequence().get(index + 1).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids_parse_and_display() {
        let id: TrainId = "R001".parse().unwrap();
        assert_eq!(id.line(), Line::Red);
        assert_eq!(id.number(), 1);
        assert_eq!(id.to_string(), "R001");

        let id: TrainId = "G123".parse().unwrap();
        assert_eq!(id.to_string(), "G123");
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!("X001".parse::<TrainId>().is_err());
        assert!("R1".parse::<TrainId>().is_err());
        assert!("R0001".parse::<TrainId>().is_err());
        assert!("R0a1".parse::<TrainId>().is_err());
        assert!("".parse::<TrainId>().is_err());
    }

    #[test]
    fn line_derives_from_letter() {
        let id = TrainId::new(Line::Blue, 42).unwrap();
        assert_eq!(id.to_string(), "B042");
        assert!(TrainId::new(Line::Blue, 1000).is_err());
    }

    #[test]
    fn speed_setter_clamps_negative() {
        let mut train = Train::new("G001".parse().unwrap(), 0);
        train.set_speed_kmh(-3.0);
        assert_eq!(train.speed_kmh(), 0.0);
    }
}
