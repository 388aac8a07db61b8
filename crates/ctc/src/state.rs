use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use model::{Block, Train, TrainId, TrainIdError};
use track::{BlockNumber, Line, TrackLayout};

use crate::failure::FailureManager;
use crate::routing::RouteManager;

/// All mutable coordination state, guarded by one coarse lock owned by the
/// system. Blocks are written only by the lock holder; the kernel reads them
/// under the same lock.
pub struct CtcState {
    pub layout: Arc<TrackLayout>,
    pub blocks: HashMap<(Line, BlockNumber), Block>,
    pub trains: HashMap<TrainId, Train>,
    pub routing: RouteManager,
    pub failure: FailureManager,
    pub throughput: HashMap<Line, u32>,
    line_counters: HashMap<Line, u16>,
    active_train_ids: HashSet<TrainId>,
}

impl CtcState {
    pub fn new(layout: Arc<TrackLayout>) -> Self {
        let mut blocks = HashMap::new();
        for line in layout.lines() {
            for data in layout.blocks(line) {
                blocks.insert((line, data.number), Block::from_track(data));
            }
        }
        log::info!("initialized {} blocks from track layout", blocks.len());
        Self {
            layout,
            blocks,
            trains: HashMap::new(),
            routing: RouteManager::new(),
            failure: FailureManager::new(),
            throughput: HashMap::new(),
            line_counters: HashMap::new(),
            active_train_ids: HashSet::new(),
        }
    }

    pub fn block(&self, line: Line, number: BlockNumber) -> Option<&Block> {
        self.blocks.get(&(line, number))
    }

    pub fn block_mut(&mut self, line: Line, number: BlockNumber) -> Option<&mut Block> {
        self.blocks.get_mut(&(line, number))
    }

    pub fn train(&self, id: &TrainId) -> Option<&Train> {
        self.trains.get(id)
    }

    pub fn train_mut(&mut self, id: &TrainId) -> Option<&mut Train> {
        self.trains.get_mut(id)
    }

    /// Trains currently on a line, by id.
    pub fn trains_on(&self, line: Line) -> Vec<TrainId> {
        self.trains
            .values()
            .filter(|train| train.line() == line)
            .map(|train| train.id().clone())
            .collect()
    }

    /// Next id from the per-line monotonic counter. Released ids are not
    /// recycled; the counter only moves forward.
    pub fn generate_train_id(&mut self, line: Line) -> Result<TrainId, TrainIdError> {
        let counter = self.line_counters.entry(line).or_insert(1);
        let id = TrainId::new(line, *counter)?;
        *counter += 1;
        self.active_train_ids.insert(id.clone());
        Ok(id)
    }

    /// Peek at the id the next generation call would produce.
    pub fn next_train_id_preview(&self, line: Line) -> Result<TrainId, TrainIdError> {
        TrainId::new(line, self.line_counters.get(&line).copied().unwrap_or(1))
    }

    /// Registers an externally supplied id and keeps the counter ahead of it.
    pub fn claim_train_id(&mut self, id: &TrainId) {
        let counter = self.line_counters.entry(id.line()).or_insert(1);
        if id.number() >= *counter {
            *counter = id.number() + 1;
        }
        self.active_train_ids.insert(id.clone());
    }

    pub fn release_train_id(&mut self, id: &TrainId) {
        self.active_train_ids.remove(id);
    }

    pub fn is_train_active(&self, id: &TrainId) -> bool {
        self.active_train_ids.contains(id)
    }

    pub fn is_block_operational(&self, line: Line, number: BlockNumber) -> bool {
        self.block(line, number)
            .map(|block| block.is_operational())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use track::TrackLayoutBuilder;

    fn state() -> CtcState {
        let layout = Arc::new(
            TrackLayoutBuilder::new()
                .line(Line::Red, 77)
                .line(Line::Green, 151)
                .build(),
        );
        CtcState::new(layout)
    }

    #[test]
    fn blocks_are_created_per_line() {
        let state = state();
        assert!(state.block(Line::Red, 0).is_some());
        assert!(state.block(Line::Red, 76).is_some());
        assert!(state.block(Line::Red, 77).is_none());
        assert!(state.block(Line::Green, 150).is_some());
    }

    #[test]
    fn train_ids_count_up_per_line() {
        let mut state = state();
        assert_eq!(
            state.generate_train_id(Line::Red).unwrap().to_string(),
            "R001"
        );
        assert_eq!(
            state.generate_train_id(Line::Red).unwrap().to_string(),
            "R002"
        );
        assert_eq!(
            state.generate_train_id(Line::Green).unwrap().to_string(),
            "G001"
        );
    }

    #[test]
    fn released_ids_are_not_recycled() {
        let mut state = state();
        let first = state.generate_train_id(Line::Red).unwrap();
        state.release_train_id(&first);
        let second = state.generate_train_id(Line::Red).unwrap();
        assert_ne!(first, second);
        assert_eq!(second.to_string(), "R002");
    }

    #[test]
    fn claimed_ids_push_the_counter_forward() {
        let mut state = state();
        state.claim_train_id(&"R007".parse().unwrap());
        assert_eq!(
            state.generate_train_id(Line::Red).unwrap().to_string(),
            "R008"
        );
    }
}
