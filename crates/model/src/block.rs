use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use track::{BlockNumber, Line, StationInfo, SwitchInfo, TrackBlock};

use crate::{train::TrainId, Authority, SpeedCommand};

const OCCUPANCY_HISTORY_LIMIT: usize = 100;

/// Position of a switch anchored at a block. The wire encoding is a bool:
/// false = lower-numbered connection, true = higher-numbered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SwitchPosition {
    #[default]
    Lower,
    Higher,
}

impl SwitchPosition {
    pub fn from_wire(value: bool) -> Self {
        if value {
            SwitchPosition::Higher
        } else {
            SwitchPosition::Lower
        }
    }

    pub fn to_wire(&self) -> bool {
        matches!(self, SwitchPosition::Higher)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BlockStateError {
    #[error("block {line} {number} has no switch")]
    NoSwitch { line: Line, number: BlockNumber },
    #[error("block {line} {number} has no crossing")]
    NoCrossing { line: Line, number: BlockNumber },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupancyTransition {
    pub at: DateTime<Utc>,
    pub occupied: bool,
    pub train: Option<TrainId>,
}

/// One physical track section on one line, with its live state. Static
/// attributes come from the track reader once at startup; occupation and
/// infrastructure state follow the field.
#[derive(Debug, Clone)]
pub struct Block {
    line: Line,
    number: BlockNumber,
    section: String,
    length_m: f64,
    grade_percent: f64,
    speed_limit_kmh: f64,
    elevation_m: f64,
    is_underground: bool,
    bidirectional: bool,
    has_switch: bool,
    has_crossing: bool,
    station: Option<StationInfo>,
    switch: Option<SwitchInfo>,

    occupied: bool,
    operational: bool,
    failed: bool,
    maintenance: bool,
    switch_position: SwitchPosition,
    crossing_active: bool,
    occupying_train: Option<TrainId>,
    scheduled_occupations: Vec<DateTime<Utc>>,
    scheduled_closures: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    occupancy_history: VecDeque<OccupancyTransition>,
}

impl Block {
    pub fn from_track(data: &TrackBlock) -> Self {
        Self {
            line: data.line,
            number: data.number,
            section: data.section.clone(),
            length_m: data.length_m,
            grade_percent: data.grade_percent,
            speed_limit_kmh: data.speed_limit_kmh,
            elevation_m: data.elevation_m,
            is_underground: data.is_underground,
            bidirectional: data.is_bidirectional(),
            has_switch: data.has_switch,
            has_crossing: data.has_crossing,
            station: data.station.clone(),
            switch: data.switch.clone(),
            occupied: false,
            operational: true,
            failed: false,
            maintenance: false,
            switch_position: SwitchPosition::default(),
            crossing_active: false,
            occupying_train: None,
            scheduled_occupations: Vec::new(),
            scheduled_closures: Vec::new(),
            occupancy_history: VecDeque::new(),
        }
    }

    pub fn line(&self) -> Line {
        self.line
    }

    pub fn number(&self) -> BlockNumber {
        self.number
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    pub fn length_m(&self) -> f64 {
        self.length_m
    }

    pub fn grade_percent(&self) -> f64 {
        self.grade_percent
    }

    pub fn speed_limit_kmh(&self) -> f64 {
        self.speed_limit_kmh
    }

    pub fn elevation_m(&self) -> f64 {
        self.elevation_m
    }

    pub fn is_underground(&self) -> bool {
        self.is_underground
    }

    pub fn is_yard(&self) -> bool {
        self.number == 0
    }

    pub fn is_bidirectional(&self) -> bool {
        self.bidirectional
    }

    pub fn has_switch(&self) -> bool {
        self.has_switch
    }

    pub fn has_crossing(&self) -> bool {
        self.has_crossing
    }

    pub fn has_station(&self) -> bool {
        self.station.is_some()
    }

    pub fn station(&self) -> Option<&StationInfo> {
        self.station.as_ref()
    }

    pub fn station_id(&self) -> u16 {
        self.station.as_ref().map(|station| station.id).unwrap_or(0)
    }

    pub fn switch(&self) -> Option<&SwitchInfo> {
        self.switch.as_ref()
    }

    pub fn switch_position(&self) -> SwitchPosition {
        self.switch_position
    }

    pub fn crossing_active(&self) -> bool {
        self.crossing_active
    }

    pub fn occupied(&self) -> bool {
        self.occupied
    }

    pub fn occupying_train(&self) -> Option<&TrainId> {
        self.occupying_train.as_ref()
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Operational means safe to route over: not failed, not closed for
    /// maintenance. Occupancy is orthogonal.
    pub fn is_operational(&self) -> bool {
        self.operational && !self.failed && !self.maintenance
    }

    /// Atomic occupation setter. Keeps `occupying_train` consistent with the
    /// occupied flag and records the transition in the bounded history.
    pub fn update_occupation(
        &mut self,
        occupied: bool,
        train: Option<TrainId>,
        now: DateTime<Utc>,
    ) {
        if self.occupied == occupied && self.occupying_train == train {
            return;
        }
        self.occupied = occupied;
        self.occupying_train = if occupied { train.clone() } else { None };
        self.occupancy_history.push_back(OccupancyTransition {
            at: now,
            occupied,
            train: self.occupying_train.clone(),
        });
        while self.occupancy_history.len() > OCCUPANCY_HISTORY_LIMIT {
            self.occupancy_history.pop_front();
        }
        log::debug!(
            "block {} {} occupation updated: {}",
            self.line,
            self.number,
            occupied
        );
    }

    pub fn occupancy_history(&self) -> impl Iterator<Item = &OccupancyTransition> {
        self.occupancy_history.iter()
    }

    pub fn set_switch_position(&mut self, position: SwitchPosition) -> Result<(), BlockStateError> {
        if !self.has_switch {
            return Err(BlockStateError::NoSwitch {
                line: self.line,
                number: self.number,
            });
        }
        if self.switch_position != position {
            log::info!(
                "block {} {} switch set to {:?}",
                self.line,
                self.number,
                position
            );
        }
        self.switch_position = position;
        Ok(())
    }

    pub fn set_crossing_status(&mut self, active: bool) -> Result<(), BlockStateError> {
        if !self.has_crossing {
            return Err(BlockStateError::NoCrossing {
                line: self.line,
                number: self.number,
            });
        }
        if self.crossing_active != active {
            log::info!(
                "block {} {} crossing active: {}",
                self.line,
                self.number,
                active
            );
        }
        self.crossing_active = active;
        Ok(())
    }

    pub fn set_failed(&mut self, failed: bool) {
        if self.failed != failed {
            if failed {
                log::warn!("block {} {} marked failed", self.line, self.number);
            } else {
                log::info!("block {} {} failure cleared", self.line, self.number);
            }
        }
        self.failed = failed;
    }

    pub fn set_maintenance(&mut self, maintenance: bool) {
        self.maintenance = maintenance;
    }

    pub fn set_operational(&mut self, operational: bool) {
        self.operational = operational;
    }

    pub fn schedule_occupation(&mut self, at: DateTime<Utc>) {
        self.scheduled_occupations.push(at);
    }

    pub fn clear_scheduled_occupations(&mut self) {
        self.scheduled_occupations.clear();
    }

    pub fn scheduled_occupations(&self) -> &[DateTime<Utc>] {
        &self.scheduled_occupations
    }

    pub fn schedule_closure(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.scheduled_closures.push((start, end));
        log::info!(
            "block {} {} closure scheduled: {} to {}",
            self.line,
            self.number,
            start,
            end
        );
    }

    pub fn is_closed_at(&self, at: DateTime<Utc>) -> bool {
        self.scheduled_closures
            .iter()
            .any(|(start, end)| *start <= at && at <= *end)
    }

    /// Authority for a train that wants to enter this block. The caller
    /// passes its own identity so occupation by itself does not count.
    pub fn calculate_safe_authority(&self, for_train: Option<&TrainId>) -> Authority {
        if !self.is_operational() {
            return Authority::Denied;
        }
        if self.crossing_active {
            return Authority::Denied;
        }
        if self.occupied {
            match (&self.occupying_train, for_train) {
                (Some(occupant), Some(train)) if occupant == train => {}
                _ => return Authority::Denied,
            }
        }
        Authority::Granted
    }

    /// Speed command for this block given the next two blocks on the route.
    pub fn calculate_suggested_speed(
        &self,
        next_block_1: Option<&Block>,
        next_block_2: Option<&Block>,
    ) -> SpeedCommand {
        if self.calculate_safe_authority(None) == Authority::Denied {
            return SpeedCommand::Stop;
        }
        let crossing_ahead = next_block_1
            .map(|block| block.crossing_active)
            .unwrap_or(false);
        if self.crossing_active || crossing_ahead {
            return SpeedCommand::Stop;
        }
        if next_block_1.map(|block| block.has_station()).unwrap_or(false) {
            return SpeedCommand::OneThird;
        }
        if self.grade_percent.abs() > 5.0 {
            return SpeedCommand::OneThird;
        }
        if next_block_2.map(|block| block.has_station()).unwrap_or(false) {
            return SpeedCommand::TwoThirds;
        }
        SpeedCommand::Full
    }
}
