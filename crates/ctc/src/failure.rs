use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use model::{Closure, ClosureId, ClosureStatus, Opening, Train, TrainId};
use serde::Serialize;
use track::{BlockNumber, Line};

use crate::error::BlockClosureConflict;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum EmergencyKind {
    BlockFailure { line: Line, block: BlockNumber },
    TrainFailure { train: TrainId },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyRecord {
    pub id: String,
    pub kind: EmergencyKind,
    pub description: String,
    pub at: DateTime<Utc>,
    pub addressed: bool,
    pub resolution: Option<String>,
}

/// Outcome of a reroute attempt for one affected train.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RerouteOutcome {
    Rerouted,
    NoRouteFound,
    TrainFailedNoReroute,
    NotStopped,
}

/// Registry of failures and maintenance closures. Pure bookkeeping: the
/// coordinator executes the wayside side effects and reports outcomes back.
pub struct FailureManager {
    failed_blocks: Vec<(Line, BlockNumber)>,
    failed_trains: Vec<TrainId>,
    maintenance_closures: HashMap<Line, BTreeSet<BlockNumber>>,
    scheduled_closures: Vec<Closure>,
    scheduled_openings: Vec<Opening>,
    stopped_trains: HashSet<TrainId>,
    emergencies: Vec<EmergencyRecord>,
    emergency_seq: u64,
}

impl FailureManager {
    pub fn new() -> Self {
        Self {
            failed_blocks: Vec::new(),
            failed_trains: Vec::new(),
            maintenance_closures: HashMap::new(),
            scheduled_closures: Vec::new(),
            scheduled_openings: Vec::new(),
            stopped_trains: HashSet::new(),
            emergencies: Vec::new(),
            emergency_seq: 0,
        }
    }

    // failed blocks and trains

    /// Records a block failure. Returns false if it was already known.
    pub fn add_failed_block(&mut self, line: Line, block: BlockNumber, now: DateTime<Utc>) -> bool {
        if self.failed_blocks.contains(&(line, block)) {
            return false;
        }
        self.failed_blocks.push((line, block));
        let description = format!("Block {} on {} line failure detected", block, line);
        log::error!("{}", description);
        self.new_emergency(EmergencyKind::BlockFailure { line, block }, description, now);
        true
    }

    pub fn remove_failed_block(&mut self, line: Line, block: BlockNumber) -> bool {
        let before = self.failed_blocks.len();
        self.failed_blocks.retain(|&entry| entry != (line, block));
        before != self.failed_blocks.len()
    }

    /// Records a train failure. Returns false if it was already known.
    pub fn add_failed_train(&mut self, train: TrainId, now: DateTime<Utc>) -> bool {
        if self.failed_trains.contains(&train) {
            return false;
        }
        let description = format!("Train {} malfunction detected", train);
        log::error!("{}", description);
        self.new_emergency(
            EmergencyKind::TrainFailure {
                train: train.clone(),
            },
            description,
            now,
        );
        self.failed_trains.push(train);
        true
    }

    pub fn is_block_failed(&self, line: Line, block: BlockNumber) -> bool {
        self.failed_blocks.contains(&(line, block))
    }

    pub fn is_train_failed(&self, train: &TrainId) -> bool {
        self.failed_trains.contains(train)
    }

    pub fn failed_blocks(&self) -> &[(Line, BlockNumber)] {
        &self.failed_blocks
    }

    pub fn failed_blocks_on(&self, line: Line) -> HashSet<BlockNumber> {
        self.failed_blocks
            .iter()
            .filter(|(failed_line, _)| *failed_line == line)
            .map(|&(_, block)| block)
            .collect()
    }

    pub fn failed_trains(&self) -> &[TrainId] {
        &self.failed_trains
    }

    /// Union of directly failed trains and trains whose active route runs
    /// over a failed block.
    pub fn find_affected_trains(&self, trains: &HashMap<TrainId, Train>) -> Vec<TrainId> {
        let mut affected: Vec<TrainId> = Vec::new();
        for train in trains.values() {
            let Some(route) = train.route().filter(|route| route.is_active()) else {
                continue;
            };
            let hit = self
                .failed_blocks
                .iter()
                .any(|&(line, block)| line == route.line() && route.contains_block(block));
            if hit {
                affected.push(train.id().clone());
            }
        }
        for failed in &self.failed_trains {
            if !affected.contains(failed) && trains.contains_key(failed) {
                affected.push(failed.clone());
            }
        }
        affected
    }

    // emergency-stop bookkeeping

    pub fn mark_stopped(&mut self, train: TrainId) {
        self.stopped_trains.insert(train);
    }

    pub fn clear_stopped(&mut self, train: &TrainId) {
        self.stopped_trains.remove(train);
    }

    pub fn was_stopped_by_failure(&self, train: &TrainId) -> bool {
        self.stopped_trains.contains(train)
    }

    // maintenance closures

    pub fn add_maintenance_closure(&mut self, line: Line, block: BlockNumber) {
        self.maintenance_closures.entry(line).or_default().insert(block);
    }

    pub fn remove_maintenance_closure(&mut self, line: Line, block: BlockNumber) {
        if let Some(blocks) = self.maintenance_closures.get_mut(&line) {
            blocks.remove(&block);
        }
    }

    pub fn is_block_closed(&self, line: Line, block: BlockNumber) -> bool {
        self.maintenance_closures
            .get(&line)
            .map(|blocks| blocks.contains(&block))
            .unwrap_or(false)
    }

    pub fn closed_blocks(&self, line: Line) -> Vec<BlockNumber> {
        self.maintenance_closures
            .get(&line)
            .map(|blocks| blocks.iter().copied().collect())
            .unwrap_or_default()
    }

    // scheduled closures

    /// Enqueues a closure starting at `at` for `duration`, paired with the
    /// opening at its end time.
    pub fn schedule_closure(
        &mut self,
        line: Line,
        block: BlockNumber,
        at: DateTime<Utc>,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<ClosureId, BlockClosureConflict> {
        if self.is_block_closed(line, block) {
            return Err(BlockClosureConflict::AlreadyClosed { line, block });
        }
        let already_scheduled = self.scheduled_closures.iter().any(|closure| {
            closure.line == line
                && closure.block == block
                && closure.status == ClosureStatus::Scheduled
        });
        if already_scheduled {
            return Err(BlockClosureConflict::AlreadyScheduled { line, block });
        }
        let closure = Closure::new(line, block, at, at + duration, now);
        let id = closure.id.clone();
        self.scheduled_openings.push(closure.opening());
        log::info!(
            "scheduled closure for block {} on {} line at {}",
            block,
            line,
            at
        );
        self.scheduled_closures.push(closure);
        Ok(id)
    }

    pub fn cancel_closure(&mut self, id: &ClosureId) -> bool {
        let mut found = false;
        for closure in &mut self.scheduled_closures {
            if &closure.id == id && closure.status == ClosureStatus::Scheduled {
                closure.status = ClosureStatus::Cancelled;
                found = true;
            }
        }
        if found {
            self.scheduled_openings
                .retain(|opening| &opening.closure_id != id);
            log::info!("cancelled scheduled closure {}", id);
        }
        found
    }

    /// Closures whose start time has been reached.
    pub fn due_closures(&self, now: DateTime<Utc>) -> Vec<Closure> {
        self.scheduled_closures
            .iter()
            .filter(|closure| closure.status == ClosureStatus::Scheduled && closure.start <= now)
            .cloned()
            .collect()
    }

    /// Openings whose time has been reached.
    pub fn due_openings(&self, now: DateTime<Utc>) -> Vec<Opening> {
        self.scheduled_openings
            .iter()
            .filter(|opening| opening.at <= now)
            .cloned()
            .collect()
    }

    pub fn mark_closure(&mut self, id: &ClosureId, status: ClosureStatus) {
        for closure in &mut self.scheduled_closures {
            if &closure.id == id {
                closure.status = status;
            }
        }
        if matches!(status, ClosureStatus::Completed | ClosureStatus::Failed) {
            self.scheduled_openings
                .retain(|opening| &opening.closure_id != id);
        }
    }

    pub fn drop_opening(&mut self, id: &ClosureId) {
        self.scheduled_openings
            .retain(|opening| &opening.closure_id != id);
    }

    pub fn scheduled_closures(&self) -> &[Closure] {
        &self.scheduled_closures
    }

    pub fn closure_status(&self, id: &ClosureId) -> Option<ClosureStatus> {
        self.scheduled_closures
            .iter()
            .find(|closure| &closure.id == id)
            .map(|closure| closure.status)
    }

    // emergencies

    pub fn emergencies(&self) -> &[EmergencyRecord] {
        &self.emergencies
    }

    fn new_emergency(&mut self, kind: EmergencyKind, description: String, now: DateTime<Utc>) {
        self.emergency_seq += 1;
        self.emergencies.push(EmergencyRecord {
            id: format!("emergency_{}_{}", self.emergency_seq, now.timestamp()),
            kind,
            description,
            at: now,
            addressed: false,
            resolution: None,
        });
    }
}

impl Default for FailureManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use model::Route;
    use std::sync::Arc;
    use track::TrackLayoutBuilder;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn train_with_route(id: &str, blocks: (u16, u16)) -> (TrainId, Train) {
        let layout = Arc::new(TrackLayoutBuilder::new().line(Line::Green, 151).build());
        let id: TrainId = id.parse().unwrap();
        let mut train = Train::new(id.clone(), blocks.0);
        let mut route = Route::create(
            &layout,
            Line::Green,
            blocks.0,
            blocks.1,
            now() + Duration::hours(2),
            now(),
        )
        .unwrap();
        route.activate(id.clone());
        train.assign_route(route);
        (id, train)
    }

    #[test]
    fn affected_trains_include_routes_over_failed_blocks() {
        let mut manager = FailureManager::new();
        let mut trains = HashMap::new();
        let (riding, train) = train_with_route("G001", (60, 80));
        trains.insert(riding.clone(), train);
        let (elsewhere, train) = train_with_route("G002", (100, 120));
        trains.insert(elsewhere.clone(), train);

        manager.add_failed_block(Line::Green, 70, now());
        let affected = manager.find_affected_trains(&trains);
        assert!(affected.contains(&riding));
        assert!(!affected.contains(&elsewhere));
    }

    #[test]
    fn directly_failed_trains_are_affected_without_failed_blocks() {
        let mut manager = FailureManager::new();
        let mut trains = HashMap::new();
        let (id, train) = train_with_route("G001", (60, 80));
        trains.insert(id.clone(), train);
        manager.add_failed_train(id.clone(), now());
        assert_eq!(manager.find_affected_trains(&trains), vec![id]);
    }

    #[test]
    fn duplicate_failures_are_not_recorded_twice() {
        let mut manager = FailureManager::new();
        assert!(manager.add_failed_block(Line::Red, 7, now()));
        assert!(!manager.add_failed_block(Line::Red, 7, now()));
        assert_eq!(manager.emergencies().len(), 1);
    }

    #[test]
    fn closure_scheduling_rejects_duplicates() {
        let mut manager = FailureManager::new();
        manager
            .schedule_closure(Line::Red, 5, now(), Duration::hours(1), now())
            .unwrap();
        let result = manager.schedule_closure(Line::Red, 5, now(), Duration::hours(2), now());
        assert!(matches!(
            result,
            Err(BlockClosureConflict::AlreadyScheduled { .. })
        ));
    }

    #[test]
    fn due_closures_and_openings_follow_the_clock() {
        let mut manager = FailureManager::new();
        let start = now() + Duration::minutes(30);
        let id = manager
            .schedule_closure(Line::Red, 5, start, Duration::hours(1), now())
            .unwrap();

        assert!(manager.due_closures(now()).is_empty());
        let due = manager.due_closures(start);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);

        manager.mark_closure(&id, ClosureStatus::Active);
        assert!(manager.due_openings(start).is_empty());
        let openings = manager.due_openings(start + Duration::hours(1));
        assert_eq!(openings.len(), 1);
        assert_eq!(openings[0].closure_id, id);
    }

    #[test]
    fn cancelling_removes_the_paired_opening() {
        let mut manager = FailureManager::new();
        let id = manager
            .schedule_closure(
                Line::Red,
                5,
                now() + Duration::hours(1),
                Duration::hours(1),
                now(),
            )
            .unwrap();
        assert!(manager.cancel_closure(&id));
        assert_eq!(manager.closure_status(&id), Some(ClosureStatus::Cancelled));
        assert!(manager
            .due_openings(now() + Duration::hours(3))
            .is_empty());
    }
}
