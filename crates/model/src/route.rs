use chrono::{DateTime, Duration, Utc};
use track::{BlockNumber, Line, TrackLayout};
use utility::id::{HasId, Id};

use crate::{Authority, SpeedCommand};

pub type RouteId = Id<Route>;

impl HasId for Route {
    type IdType = String;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteCreateError {
    #[error("line {0} is not part of the loaded track")]
    UnknownLine(Line),
    #[error("block {block} does not exist on line {line}")]
    UnknownBlock { line: Line, block: BlockNumber },
    #[error("line {0} has no yard exit")]
    NoYardExit(Line),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Position moved within the route.
    Moved,
    /// The final block was reached; the route deactivated itself.
    Completed,
    /// The block is not part of this route.
    NotOnRoute,
}

/// A plan: ordered, physically connected block sequence from start to end
/// with schedule bookkeeping and per-block look-ahead values.
#[derive(Debug, Clone)]
pub struct Route {
    id: RouteId,
    line: Line,
    start_block: BlockNumber,
    end_block: BlockNumber,
    block_sequence: Vec<BlockNumber>,
    authority_sequence: Vec<Authority>,
    speed_sequence: Vec<SpeedCommand>,
    scheduled_arrival: DateTime<Utc>,
    scheduled_departure: Option<DateTime<Utc>>,
    estimated_travel_time: Duration,
    minimum_travel_time: Duration,
    current_block_index: usize,
    is_active: bool,
    train_id: Option<crate::TrainId>,
    actual_departure: Option<DateTime<Utc>>,
    actual_arrival: Option<DateTime<Utc>>,
}

impl Route {
    /// Computes the block sequence by monotonic progression over block
    /// numbers. Departures from the yard first take the line's yard exit
    /// block, then progress toward the destination.
    pub fn create(
        layout: &TrackLayout,
        line: Line,
        start: BlockNumber,
        end: BlockNumber,
        arrival: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Self, RouteCreateError> {
        if !layout.has_line(line) {
            return Err(RouteCreateError::UnknownLine(line));
        }
        let length = layout.line_length(line) as BlockNumber;
        for block in [start, end] {
            if block >= length {
                return Err(RouteCreateError::UnknownBlock { line, block });
            }
        }

        let mut sequence = vec![start];
        let mut cursor = start;
        if start == 0 && end != 0 {
            let exit = layout
                .yard_exit_block(line)
                .ok_or(RouteCreateError::NoYardExit(line))?;
            sequence.push(exit);
            cursor = exit;
        }
        while cursor != end {
            cursor = if end > cursor { cursor + 1 } else { cursor - 1 };
            sequence.push(cursor);
        }

        let (estimated, minimum) = travel_times(layout, line, &sequence);
        let id = RouteId::new(format!("route_{}_{}_{}", start, end, now.timestamp()));
        let sequence_len = sequence.len();

        Ok(Self {
            id,
            line,
            start_block: start,
            end_block: end,
            block_sequence: sequence,
            authority_sequence: vec![Authority::Denied; sequence_len],
            speed_sequence: vec![SpeedCommand::Stop; sequence_len],
            scheduled_arrival: arrival,
            scheduled_departure: Some(arrival - estimated),
            estimated_travel_time: estimated,
            minimum_travel_time: minimum,
            current_block_index: 0,
            is_active: false,
            train_id: None,
            actual_departure: None,
            actual_arrival: None,
        })
    }

    /// Builds a route over an explicitly given block sequence, for paths
    /// that do not follow plain monotonic numbering (switch legs,
    /// alternatives around closures). The sequence must be non-empty.
    pub fn with_sequence(
        layout: &TrackLayout,
        line: Line,
        sequence: Vec<BlockNumber>,
        arrival: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Self, RouteCreateError> {
        if !layout.has_line(line) {
            return Err(RouteCreateError::UnknownLine(line));
        }
        let length = layout.line_length(line) as BlockNumber;
        for &block in &sequence {
            if block >= length {
                return Err(RouteCreateError::UnknownBlock { line, block });
            }
        }
        let (start, end) = match (sequence.first(), sequence.last()) {
            (Some(&start), Some(&end)) => (start, end),
            _ => return Err(RouteCreateError::UnknownBlock { line, block: 0 }),
        };
        let (estimated, minimum) = travel_times(layout, line, &sequence);
        let id = RouteId::new(format!("route_{}_{}_{}", start, end, now.timestamp()));
        let sequence_len = sequence.len();
        Ok(Self {
            id,
            line,
            start_block: start,
            end_block: end,
            block_sequence: sequence,
            authority_sequence: vec![Authority::Denied; sequence_len],
            speed_sequence: vec![SpeedCommand::Stop; sequence_len],
            scheduled_arrival: arrival,
            scheduled_departure: Some(arrival - estimated),
            estimated_travel_time: estimated,
            minimum_travel_time: minimum,
            current_block_index: 0,
            is_active: false,
            train_id: None,
            actual_departure: None,
            actual_arrival: None,
        })
    }

    /// Fresh copy of this plan for a new arrival time: same sequence, reset
    /// position and activation state, re-derived schedule.
    pub fn clone_with_arrival(&self, arrival: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let mut clone = self.clone();
        clone.id = RouteId::new(format!(
            "route_{}_{}_{}",
            self.start_block,
            self.end_block,
            now.timestamp()
        ));
        clone.scheduled_arrival = arrival;
        clone.scheduled_departure = Some(arrival - self.estimated_travel_time);
        clone.current_block_index = 0;
        clone.is_active = false;
        clone.train_id = None;
        clone.actual_departure = None;
        clone.actual_arrival = None;
        clone
    }

    pub fn id(&self) -> &RouteId {
        &self.id
    }

    pub fn line(&self) -> Line {
        self.line
    }

    pub fn start_block(&self) -> BlockNumber {
        self.start_block
    }

    pub fn end_block(&self) -> BlockNumber {
        self.end_block
    }

    pub fn block_sequence(&self) -> &[BlockNumber] {
        &self.block_sequence
    }

    pub fn contains_block(&self, block: BlockNumber) -> bool {
        self.block_sequence.contains(&block)
    }

    pub fn scheduled_arrival(&self) -> DateTime<Utc> {
        self.scheduled_arrival
    }

    pub fn scheduled_departure(&self) -> Option<DateTime<Utc>> {
        self.scheduled_departure
    }

    pub fn estimated_travel_time(&self) -> Duration {
        self.estimated_travel_time
    }

    pub fn actual_departure(&self) -> Option<DateTime<Utc>> {
        self.actual_departure
    }

    pub fn actual_arrival(&self) -> Option<DateTime<Utc>> {
        self.actual_arrival
    }

    pub fn current_block_index(&self) -> usize {
        self.current_block_index
    }

    pub fn current_block(&self) -> BlockNumber {
        self.block_sequence[self.current_block_index]
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn train_id(&self) -> Option<&crate::TrainId> {
        self.train_id.as_ref()
    }

    pub fn activate(&mut self, train: crate::TrainId) {
        self.is_active = true;
        self.train_id = Some(train);
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        if self.actual_arrival.is_none() && self.current_block_index == self.block_sequence.len() - 1
        {
            self.actual_arrival = Some(now);
        }
    }

    /// True iff the sequence is pairwise connected, every block is currently
    /// operational and the scheduled arrival is still reachable.
    pub fn validate(
        &self,
        layout: &TrackLayout,
        now: DateTime<Utc>,
        block_operational: impl Fn(BlockNumber) -> bool,
    ) -> bool {
        if self.block_sequence.is_empty() {
            return false;
        }
        for pair in self.block_sequence.windows(2) {
            if !layout.blocks_connected(self.line, pair[0], pair[1]) {
                log::warn!(
                    "route {} validation failed: blocks {} and {} not connected",
                    self.id,
                    pair[0],
                    pair[1]
                );
                return false;
            }
        }
        for &block in &self.block_sequence {
            if !block_operational(block) {
                log::warn!(
                    "route {} validation failed: block {} not operational",
                    self.id,
                    block
                );
                return false;
            }
        }
        if self.scheduled_arrival < now + self.minimum_travel_time {
            log::warn!("route {} validation failed: arrival not reachable", self.id);
            return false;
        }
        true
    }

    /// Moves the position to the given block. Records the actual departure
    /// on the first advance and the actual arrival on the last block.
    pub fn advance_to(&mut self, block: BlockNumber, now: DateTime<Utc>) -> AdvanceOutcome {
        let Some(index) = self.index_of(block) else {
            log::warn!("route {}: block {} not in sequence", self.id, block);
            return AdvanceOutcome::NotOnRoute;
        };
        let old_index = self.current_block_index;
        self.current_block_index = index;
        if old_index == 0 && index > 0 && self.actual_departure.is_none() {
            self.actual_departure = Some(now);
        }
        if index == self.block_sequence.len() - 1 {
            self.actual_arrival = Some(now);
            self.is_active = false;
            return AdvanceOutcome::Completed;
        }
        AdvanceOutcome::Moved
    }

    pub fn index_of(&self, block: BlockNumber) -> Option<usize> {
        self.block_sequence.iter().position(|&b| b == block)
    }

    /// Route distance in hops between two blocks along this sequence, not
    /// the arithmetic difference of their numbers.
    pub fn distance(&self, from: BlockNumber, to: BlockNumber) -> Option<i32> {
        let from_index = self.index_of(from)? as i32;
        let to_index = self.index_of(to)? as i32;
        Some(to_index - from_index)
    }

    /// Block `offset` hops ahead of the current position, clamped to the
    /// final block near the route end.
    pub fn block_at_offset(&self, offset: usize) -> BlockNumber {
        let index = (self.current_block_index + offset).min(self.block_sequence.len() - 1);
        self.block_sequence[index]
    }

    /// Recomputes the per-block authority/speed sequences.
    pub fn recalculate_lookahead(
        &mut self,
        mut f: impl FnMut(BlockNumber, usize) -> (Authority, SpeedCommand),
    ) {
        for (index, &block) in self.block_sequence.iter().enumerate() {
            let (authority, speed) = f(block, index);
            self.authority_sequence[index] = authority;
            self.speed_sequence[index] = speed;
        }
    }

    /// Authority/speed for the next `n` blocks from the current position,
    /// zero padded beyond the end of the sequence.
    pub fn lookahead(&self, n: usize) -> (Vec<Authority>, Vec<SpeedCommand>) {
        let start = self.current_block_index;
        let mut authorities = Vec::with_capacity(n);
        let mut speeds = Vec::with_capacity(n);
        for offset in 0..n {
            match start.checked_add(offset).map(|i| {
                (
                    self.authority_sequence.get(i).copied(),
                    self.speed_sequence.get(i).copied(),
                )
            }) {
                Some((Some(authority), Some(speed))) => {
                    authorities.push(authority);
                    speeds.push(speed);
                }
                _ => {
                    authorities.push(Authority::Denied);
                    speeds.push(SpeedCommand::Stop);
                }
            }
        }
        (authorities, speeds)
    }

    pub fn remaining_blocks(&self) -> &[BlockNumber] {
        &self.block_sequence[self.current_block_index..]
    }
}

/// Estimated time assumes an average of 60% of the fastest limit on the
/// route; the minimum assumes every block is traversed at its full limit.
fn travel_times(
    layout: &TrackLayout,
    line: Line,
    sequence: &[BlockNumber],
) -> (Duration, Duration) {
    let mut total_distance_m = 0.0;
    let mut max_limit = 0.0f64;
    let mut minimum_seconds = 0.0;
    for &number in sequence {
        if let Some(block) = layout.block(line, number) {
            total_distance_m += block.length_m;
            max_limit = max_limit.max(block.speed_limit_kmh);
            if block.speed_limit_kmh > 0.0 {
                minimum_seconds += (block.length_m / 1000.0) / block.speed_limit_kmh * 3600.0;
            }
        }
    }
    let estimated_seconds = if max_limit > 0.0 {
        (total_distance_m / 1000.0) / (max_limit * 0.6) * 3600.0
    } else {
        0.0
    };
    (
        Duration::seconds(estimated_seconds as i64),
        Duration::seconds(minimum_seconds as i64),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use track::TrackLayoutBuilder;

    fn layout() -> TrackLayout {
        TrackLayoutBuilder::new()
            .line(Line::Green, 151)
            .switch(Line::Green, 0, &[(0, 63)])
            .build()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn arrival() -> DateTime<Utc> {
        now() + Duration::hours(2)
    }

    #[test]
    fn yard_departure_goes_through_yard_exit() {
        let route = Route::create(&layout(), Line::Green, 0, 66, arrival(), now()).unwrap();
        assert_eq!(&route.block_sequence()[..5], &[0, 63, 64, 65, 66]);
        assert_eq!(route.start_block(), 0);
        assert_eq!(route.end_block(), 66);
    }

    #[test]
    fn descending_routes_decrement() {
        let route = Route::create(&layout(), Line::Green, 20, 15, arrival(), now()).unwrap();
        assert_eq!(route.block_sequence(), &[20, 19, 18, 17, 16, 15]);
    }

    #[test]
    fn distance_is_route_hops_not_arithmetic() {
        let route = Route::create(&layout(), Line::Green, 0, 66, arrival(), now()).unwrap();
        // sequence [0, 63, 64, 65, 66]: one hop from yard to 63
        assert_eq!(route.distance(0, 63), Some(1));
        assert_eq!(route.distance(0, 66), Some(4));
        assert_eq!(route.distance(63, 66), Some(3));
        assert_eq!(route.distance(0, 70), None);
    }

    #[test]
    fn explicit_sequences_measure_distance_in_hops() {
        let layout = TrackLayoutBuilder::new().line(Line::Green, 151).build();
        let route =
            Route::with_sequence(&layout, Line::Green, vec![10, 20, 11, 30], arrival(), now())
                .unwrap();
        assert_eq!(route.distance(10, 30), Some(3));
        assert_eq!(route.distance(20, 11), Some(1));
        assert_eq!(route.start_block(), 10);
        assert_eq!(route.end_block(), 30);
    }

    #[test]
    fn cloned_plans_reset_position_and_activation() {
        let mut route = Route::create(&layout(), Line::Green, 0, 66, arrival(), now()).unwrap();
        route.activate("G001".parse().unwrap());
        route.advance_to(63, now());
        let clone = route.clone_with_arrival(arrival() + Duration::hours(1), now());
        assert_eq!(clone.block_sequence(), route.block_sequence());
        assert_eq!(clone.current_block_index(), 0);
        assert!(!clone.is_active());
        assert!(clone.train_id().is_none());
        assert_eq!(clone.scheduled_arrival(), arrival() + Duration::hours(1));
    }

    #[test]
    fn target_block_clamps_at_route_end() {
        let mut route = Route::create(&layout(), Line::Green, 0, 66, arrival(), now()).unwrap();
        assert_eq!(route.block_at_offset(4), 66);
        route.advance_to(65, now());
        assert_eq!(route.block_at_offset(4), 66);
    }

    #[test]
    fn advance_records_departure_and_arrival() {
        let mut route = Route::create(&layout(), Line::Green, 0, 65, arrival(), now()).unwrap();
        route.activate("G001".parse().unwrap());
        assert_eq!(route.advance_to(63, now()), AdvanceOutcome::Moved);
        assert!(route.actual_departure().is_some());
        assert!(route.actual_arrival().is_none());
        assert_eq!(route.advance_to(65, now()), AdvanceOutcome::Completed);
        assert!(route.actual_arrival().is_some());
        assert!(!route.is_active());
    }

    #[test]
    fn advance_rejects_foreign_blocks() {
        let mut route = Route::create(&layout(), Line::Green, 0, 65, arrival(), now()).unwrap();
        assert_eq!(route.advance_to(140, now()), AdvanceOutcome::NotOnRoute);
        assert_eq!(route.current_block_index(), 0);
    }

    #[test]
    fn lookahead_pads_past_route_end() {
        let mut route = Route::create(&layout(), Line::Green, 0, 64, arrival(), now()).unwrap();
        route.recalculate_lookahead(|_, _| (Authority::Granted, SpeedCommand::Full));
        route.advance_to(63, now());
        let (authorities, speeds) = route.lookahead(4);
        assert_eq!(authorities.len(), 4);
        assert_eq!(
            authorities,
            vec![
                Authority::Granted,
                Authority::Granted,
                Authority::Denied,
                Authority::Denied
            ]
        );
        assert_eq!(speeds[2], SpeedCommand::Stop);
    }

    #[test]
    fn validation_fails_on_dead_block_or_tight_schedule() {
        let route = Route::create(&layout(), Line::Green, 0, 66, arrival(), now()).unwrap();
        assert!(route.validate(&layout(), now(), |_| true));
        assert!(!route.validate(&layout(), now(), |block| block != 64));
        // one second from now is not enough for five blocks
        let soon = Route::create(
            &layout(),
            Line::Green,
            0,
            66,
            now() + Duration::seconds(1),
            now(),
        )
        .unwrap();
        assert!(!soon.validate(&layout(), now(), |_| true));
    }
}
