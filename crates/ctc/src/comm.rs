//! Communication core: the event-driven protocol between the CTC office and
//! the wayside controllers. Inbound reports are queued and drained by one
//! background worker; outbound command batches always carry the full line
//! state and are fanned out to every controller on the affected line.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use model::{AdvanceOutcome, RoutingStatus, TrainId};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use track::{BlockNumber, Line};
use utility::clock::Clock;

use crate::error::{CtcError, ProtocolViolation};
use crate::events::{CtcEvent, EventBus};
use crate::kernel;
use crate::state::CtcState;
use crate::wayside::{
    ControllerId, FieldKind, TrainCommands, WaysideController, WaysideRegistry,
};

/// Commands are generated for the block this many route hops ahead of the
/// train's current position.
pub const TARGET_LOOKAHEAD_HOPS: usize = 4;

/// Number of blocks commanded during a yard departure.
pub const DEPARTURE_COMMAND_COUNT: usize = 4;

/// Simulated seconds between successive yard departure commands.
pub const DEPARTURE_SPACING_SECONDS: i64 = 2;

/// One queued inbound report from a wayside controller.
#[derive(Debug)]
struct FieldReport {
    kind: FieldKind,
    values: Vec<bool>,
    sender: ControllerId,
    received_at: DateTime<Utc>,
}

struct CommInner {
    state: Arc<Mutex<CtcState>>,
    registry: StdMutex<WaysideRegistry>,
    previous_line_states: StdMutex<HashMap<(Line, FieldKind), Vec<bool>>>,
    departures: StdMutex<HashMap<TrainId, CancellationToken>>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    cancel: CancellationToken,
}

/// Handle to the communication core. Cloning is cheap; all clones share the
/// same worker and registry.
#[derive(Clone)]
pub struct CommunicationCore {
    inner: Arc<CommInner>,
    tx: mpsc::UnboundedSender<FieldReport>,
}

impl CommunicationCore {
    /// Creates the core and spawns its message worker.
    pub fn new(
        state: Arc<Mutex<CtcState>>,
        registry: WaysideRegistry,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(CommInner {
            state,
            registry: StdMutex::new(registry),
            previous_line_states: StdMutex::new(HashMap::new()),
            departures: StdMutex::new(HashMap::new()),
            clock,
            events,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run_worker(inner.clone(), rx));
        log::info!("communication core initialized");
        Self { inner, tx }
    }

    /// Stops the worker and any in-flight departure sequences.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        log::info!("communication core shutdown requested");
    }

    // registration

    /// Registers a wayside controller under the strict protocol checks.
    /// Violations propagate to the caller and leave the registry untouched.
    pub fn provide_wayside_controller(
        &self,
        controller: Arc<dyn WaysideController>,
        blocks_covered: Vec<bool>,
        red_line: bool,
    ) -> Result<ControllerId, ProtocolViolation> {
        let mut registry = self.inner.registry.lock().unwrap();
        registry.register(controller, blocks_covered, red_line)
    }

    pub fn controller_for_block(&self, line: Line, block: BlockNumber) -> Option<ControllerId> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .controller_for_block(line, block)
            .cloned()
    }

    pub fn controllers_on(&self, line: Line) -> Vec<ControllerId> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .controllers_on(line)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    // inbound pipeline

    pub fn update_occupied_blocks(
        &self,
        values: Vec<bool>,
        sender: &str,
    ) -> Result<(), ProtocolViolation> {
        self.enqueue(FieldKind::Occupancy, values, sender)
    }

    pub fn update_switch_positions(
        &self,
        values: Vec<bool>,
        sender: &str,
    ) -> Result<(), ProtocolViolation> {
        self.enqueue(FieldKind::Switches, values, sender)
    }

    pub fn update_railway_crossings(
        &self,
        values: Vec<bool>,
        sender: &str,
    ) -> Result<(), ProtocolViolation> {
        self.enqueue(FieldKind::Crossings, values, sender)
    }

    /// Validates an inbound array against the sender's registration and
    /// queues it for the worker. Returns immediately after the enqueue.
    fn enqueue(
        &self,
        kind: FieldKind,
        values: Vec<bool>,
        sender: &str,
    ) -> Result<(), ProtocolViolation> {
        let sender = ControllerId::from_name(sender.trim());
        {
            let registry = self.inner.registry.lock().unwrap();
            let line = registry
                .line_of(&sender)
                .ok_or_else(|| ProtocolViolation::UnknownSender(sender.clone()))?;
            let expected = registry.line_length(line);
            if values.len() != expected {
                return Err(ProtocolViolation::ArrayLengthMismatch {
                    kind,
                    line,
                    expected,
                    got: values.len(),
                });
            }
        }
        let report = FieldReport {
            kind,
            values,
            sender,
            received_at: self.inner.clock.now(),
        };
        log::debug!(
            "received {:?} update ({} blocks) from {}",
            report.kind,
            report.values.len(),
            report.sender
        );
        if self.tx.send(report).is_err() {
            log::warn!("inbound report dropped: communication worker stopped");
        }
        Ok(())
    }

    // outbound

    /// Sends the batched full-line command update for a line. Normally
    /// driven by occupancy changes; route activation uses it for the
    /// initial command as well.
    pub async fn send_updated_train_commands(&self, line: Line) {
        self.inner.send_updated_train_commands(line).await;
    }

    /// Starts the timed yard departure sequence for a train: one command for
    /// each of the first four route blocks, two simulated seconds apart.
    pub async fn send_departure_commands(&self, train_id: &TrainId) -> Result<(), CtcError> {
        let (line, departure_blocks) = {
            let state = self.inner.state.lock().await;
            let train = state
                .train(train_id)
                .ok_or_else(|| CtcError::UnknownTrain(train_id.clone()))?;
            let route = train
                .route()
                .ok_or_else(|| CtcError::NoRoute(train_id.clone()))?;
            let blocks: Vec<BlockNumber> = route
                .block_sequence()
                .iter()
                .copied()
                .skip(1)
                .take(DEPARTURE_COMMAND_COUNT)
                .collect();
            (route.line(), blocks)
        };
        if departure_blocks.is_empty() {
            return Err(CtcError::NoRoute(train_id.clone()));
        }

        let token = self.inner.cancel.child_token();
        {
            let mut departures = self.inner.departures.lock().unwrap();
            if let Some(previous) = departures.insert(train_id.clone(), token.clone()) {
                previous.cancel();
            }
        }

        let inner = self.inner.clone();
        let train = train_id.clone();
        log::info!(
            "starting departure sequence for train {} on {} line: blocks {:?}",
            train,
            line,
            departure_blocks
        );
        tokio::spawn(async move {
            let start = inner.clock.now();
            for (index, &block) in departure_blocks.iter().enumerate() {
                let send_at = start + Duration::seconds(DEPARTURE_SPACING_SECONDS * index as i64);
                loop {
                    if token.is_cancelled() {
                        log::info!("departure sequence for train {} cancelled", train);
                        return;
                    }
                    if inner.clock.now() >= send_at {
                        break;
                    }
                    // short real-time sleep; the simulated clock may run at
                    // any multiplier
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                let Some(batch) = inner.departure_batch(&train, block, (index + 1) as u16).await
                else {
                    log::info!(
                        "departure sequence for train {} stopped: train left the system",
                        train
                    );
                    return;
                };
                inner.fan_out_commands(line, &batch).await;
                log::info!(
                    "departure command {}/{} sent for train {} to block {}",
                    index + 1,
                    departure_blocks.len(),
                    train,
                    block
                );
            }
            inner.departures.lock().unwrap().remove(&train);
        });
        Ok(())
    }

    /// Cancels an in-flight departure sequence, if any.
    pub fn cancel_departure(&self, train_id: &TrainId) {
        if let Some(token) = self.inner.departures.lock().unwrap().remove(train_id) {
            token.cancel();
        }
    }

    /// Emergency stop through the standard batched command path: speed 0,
    /// authority 0 at the train's current block.
    pub async fn stop_train(&self, train_id: &TrainId) -> Result<(), CtcError> {
        let (line, batch) = {
            let state = self.inner.state.lock().await;
            let train = state
                .train(train_id)
                .ok_or_else(|| CtcError::UnknownTrain(train_id.clone()))?;
            let line = train.line();
            let length = state.layout.line_length(line);
            let current = train.current_block() as usize;
            let mut batch = TrainCommands::zeroed(length);
            if current < length {
                batch.block_num[current] = train.current_block();
                batch.update_block_in_queue[current] = 1;
            }
            (line, batch)
        };
        self.inner.fan_out_commands(line, &batch).await;
        log::warn!("emergency stop sent for train {}", train_id);
        Ok(())
    }

    /// Notifies the wayside of a manual closure or opening: the full line
    /// occupation array with the target block forced.
    pub async fn send_maintenance_closure(&self, line: Line, block: BlockNumber, closed: bool) {
        let occupations = {
            let state = self.inner.state.lock().await;
            let length = state.layout.line_length(line);
            let mut occupations: Vec<bool> = (0..length)
                .map(|number| {
                    state
                        .block(line, number as BlockNumber)
                        .map(|block| block.occupied())
                        .unwrap_or(false)
                })
                .collect();
            if (block as usize) < length {
                occupations[block as usize] = closed;
            }
            occupations
        };
        let controllers = self.inner.controllers_snapshot(line);
        for (id, handle) in controllers {
            if let Err(why) = handle.set_occupied(&occupations).await {
                log::error!("failed to send occupation update to {}: {}", id, why);
            }
        }
        let action = if closed { "close" } else { "open" };
        log::info!(
            "block {} {} sent via set_occupied on {} line",
            block,
            action,
            line
        );
    }

    /// Sends full-line switch positions to every controller on the line.
    pub async fn command_switches(&self, line: Line) {
        let positions = {
            let state = self.inner.state.lock().await;
            let length = state.layout.line_length(line);
            (0..length)
                .map(|number| {
                    state
                        .block(line, number as BlockNumber)
                        .map(|block| block.switch_position().to_wire())
                        .unwrap_or(false)
                })
                .collect::<Vec<bool>>()
        };
        let controllers = self.inner.controllers_snapshot(line);
        for (id, handle) in controllers {
            if let Err(why) = handle.command_switch(&positions).await {
                log::error!("failed to send switch commands to {}: {}", id, why);
            }
        }
    }

    /// Throughput update from the ticket system: per-line counter only.
    pub async fn tickets_purchased(&self, line: Line, tickets: u32) {
        let total = {
            let mut state = self.inner.state.lock().await;
            let counter = state.throughput.entry(line).or_insert(0);
            *counter += tickets;
            *counter
        };
        self.inner
            .events
            .publish(CtcEvent::ThroughputUpdated { line, total });
        log::info!("tickets purchased: {} for {} line", tickets, line);
    }
}

async fn run_worker(inner: Arc<CommInner>, mut rx: mpsc::UnboundedReceiver<FieldReport>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            report = rx.recv() => {
                let Some(report) = report else { break };
                // runtime errors never kill the worker
                if let Err(why) = inner.handle_report(report).await {
                    log::error!("error processing wayside report: {}", why);
                }
            }
        }
    }
    log::info!("communication worker stopped");
}

impl CommInner {
    async fn handle_report(&self, report: FieldReport) -> Result<(), CtcError> {
        let (line, full_state, has_changes) = {
            let mut registry = self.registry.lock().unwrap();
            let line = registry
                .line_of(&report.sender)
                .ok_or_else(|| ProtocolViolation::UnknownSender(report.sender.clone()))?;
            registry.store_report(&report.sender, report.kind, &report.values)?;
            let full = registry.reassemble_line_state(report.kind, line);
            drop(registry);

            let mut previous = self.previous_line_states.lock().unwrap();
            let has_changes = previous
                .get(&(line, report.kind))
                .map(|snapshot| snapshot != &full)
                .unwrap_or(true);
            if has_changes {
                previous.insert((line, report.kind), full.clone());
            }
            (line, full, has_changes)
        };

        match report.kind {
            FieldKind::Occupancy => {
                if has_changes {
                    log::debug!(
                        "occupancy changed on {} line (reported {} at {})",
                        line,
                        report.sender,
                        report.received_at
                    );
                    self.apply_occupancy(line, &full_state).await;
                    self.send_updated_train_commands(line).await;
                    self.events.publish(CtcEvent::MapUpdated { line });
                }
            }
            FieldKind::Switches => {
                self.apply_switches(line, &report.sender, &full_state).await;
            }
            FieldKind::Crossings => {
                self.apply_crossings(line, &report.sender, &full_state).await;
            }
        }
        Ok(())
    }

    /// Folds a reassembled occupancy snapshot into block and train state:
    /// advances trains whose next route blocks lit up, then rewrites block
    /// occupation with train attribution.
    async fn apply_occupancy(&self, line: Line, full: &[bool]) {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let mut attribution: HashMap<BlockNumber, TrainId> = HashMap::new();
        for id in state.trains_on(line) {
            let Some(train) = state.train(&id) else {
                continue;
            };
            let current = train.current_block();
            let mut moved_to = None;
            if let Some(route) = train.route().filter(|route| route.is_active()) {
                let vacated = (current as usize) < full.len() && !full[current as usize];
                if vacated {
                    let sequence = route.block_sequence();
                    let current_index = route.current_block_index();
                    // look a few hops ahead for the block the train moved to
                    for hop in 1..=3usize {
                        let Some(&candidate) = sequence.get(current_index + hop) else {
                            break;
                        };
                        if (candidate as usize) < full.len() && full[candidate as usize] {
                            moved_to = Some(candidate);
                            break;
                        }
                    }
                }
            }
            if let Some(block) = moved_to {
                if let Some(train) = state.train_mut(&id) {
                    train.set_current_block(block);
                    let outcome = train
                        .route_mut()
                        .map(|route| route.advance_to(block, now))
                        .unwrap_or(AdvanceOutcome::NotOnRoute);
                    if outcome == AdvanceOutcome::Completed {
                        train.set_routing_status(RoutingStatus::Stopped);
                        log::info!("train {} completed its route at block {}", id, block);
                    }
                }
                self.events.publish(CtcEvent::TrainUpdated { train: id.clone() });
                attribution.insert(block, id);
            } else {
                attribution.insert(current, id);
            }
        }

        for (index, &occupied) in full.iter().enumerate() {
            let number = index as BlockNumber;
            let train = if occupied {
                attribution.get(&number).cloned()
            } else {
                None
            };
            if let Some(block) = state.block_mut(line, number) {
                block.update_occupation(occupied, train, now);
            }
        }

        refresh_route_lookaheads(&mut state, line);
    }

    async fn apply_switches(&self, line: Line, sender: &ControllerId, full: &[bool]) {
        let mask = {
            let registry = self.registry.lock().unwrap();
            registry.mask_of(sender).map(|mask| mask.to_vec())
        };
        let Some(mask) = mask else { return };
        let mut state = self.state.lock().await;
        for (index, &position) in full.iter().enumerate() {
            if !mask.get(index).copied().unwrap_or(false) {
                continue;
            }
            let number = index as BlockNumber;
            if let Some(block) = state.block_mut(line, number) {
                if block.has_switch() {
                    let _ = block.set_switch_position(model::SwitchPosition::from_wire(position));
                }
            }
        }
    }

    async fn apply_crossings(&self, line: Line, sender: &ControllerId, full: &[bool]) {
        let mask = {
            let registry = self.registry.lock().unwrap();
            registry.mask_of(sender).map(|mask| mask.to_vec())
        };
        let Some(mask) = mask else { return };
        let mut state = self.state.lock().await;
        for (index, &active) in full.iter().enumerate() {
            if !mask.get(index).copied().unwrap_or(false) {
                continue;
            }
            let number = index as BlockNumber;
            if let Some(block) = state.block_mut(line, number) {
                if block.has_crossing() {
                    let _ = block.set_crossing_status(active);
                }
            }
        }
    }

    async fn send_updated_train_commands(&self, line: Line) {
        let batch = {
            let state = self.state.lock().await;
            build_line_batch(&state, line)
        };
        let Some(batch) = batch else {
            log::debug!("no active trains on {} line, nothing to send", line);
            return;
        };
        log::debug!(
            "sending batched commands for {} line: targets {:?}",
            line,
            batch
                .block_num
                .iter()
                .filter(|&&block| block > 0)
                .collect::<Vec<_>>()
        );
        self.fan_out_commands(line, &batch).await;
    }

    /// One yard departure step: the command for `block` placed at array
    /// index 0 with authority and speed from the safety kernel. Unsafe
    /// conditions still send, with the kernel's reduced values.
    async fn departure_batch(
        &self,
        train_id: &TrainId,
        block: BlockNumber,
        hops: u16,
    ) -> Option<TrainCommands> {
        let state = self.state.lock().await;
        if !state.is_train_active(train_id) {
            return None;
        }
        let train = state.train(train_id)?;
        let route = train.route()?;
        let line = route.line();
        let length = state.layout.line_length(line);
        let mut batch = TrainCommands::zeroed(length);
        let (authority, speed) = kernel::calculate(&state, train_id, block, route);
        let next_station = state.layout.station_id(line, route.end_block());
        batch.suggested_speed[0] = speed.as_u8();
        batch.authority[0] = authority.as_u8();
        batch.block_num[0] = block;
        batch.update_block_in_queue[0] = 0;
        batch.next_station[0] = next_station;
        batch.blocks_away[0] = hops;
        Some(batch)
    }

    fn controllers_snapshot(
        &self,
        line: Line,
    ) -> Vec<(ControllerId, Arc<dyn WaysideController>)> {
        self.registry.lock().unwrap().controllers_on(line)
    }

    /// Sends a command batch to every controller on the line. A failing
    /// controller is logged and the batch continues with the rest.
    async fn fan_out_commands(&self, line: Line, batch: &TrainCommands) {
        let controllers = self.controllers_snapshot(line);
        if controllers.is_empty() {
            log::warn!("no controllers registered for {} line", line);
            return;
        }
        for (id, handle) in controllers {
            if let Err(why) = handle.command_train(batch).await {
                log::error!("failed to send train commands to {}: {}", id, why);
            }
        }
    }
}

/// Builds the full-line command batch: for every train with an active route,
/// the instruction for the block four hops ahead, written at the index of
/// the train's current block.
pub(crate) fn build_line_batch(state: &CtcState, line: Line) -> Option<TrainCommands> {
    let length = state.layout.line_length(line);
    if length == 0 {
        return None;
    }
    let mut batch = TrainCommands::zeroed(length);
    let mut any = false;
    for train in state.trains.values() {
        if train.line() != line {
            continue;
        }
        let Some(route) = train.route().filter(|route| route.is_active()) else {
            continue;
        };
        let current = train.current_block();
        if current as usize >= length {
            log::warn!(
                "train {} current block {} exceeds {} line length {}",
                train.id(),
                current,
                line,
                length
            );
            continue;
        }
        let target = route.block_at_offset(TARGET_LOOKAHEAD_HOPS);
        let hops = route.distance(current, target).unwrap_or(0).max(0) as u16;
        // trains held by a failure stay at stop/no-authority until rerouted
        let emergency_hold = state.failure.is_train_failed(train.id())
            || state.failure.was_stopped_by_failure(train.id());
        let (authority, speed) = if emergency_hold {
            (model::Authority::Denied, model::SpeedCommand::Stop)
        } else {
            kernel::calculate(state, train.id(), target, route)
        };
        let index = current as usize;
        batch.suggested_speed[index] = speed.as_u8();
        batch.authority[index] = authority.as_u8();
        batch.block_num[index] = target;
        batch.update_block_in_queue[index] = 0;
        batch.next_station[index] = state.layout.station_id(line, route.end_block());
        batch.blocks_away[index] = hops;
        any = true;
    }
    any.then_some(batch)
}

/// Recomputes every active route's per-block authority/speed sequences on a
/// line from current block state.
pub(crate) fn refresh_route_lookaheads(state: &mut CtcState, line: Line) {
    let CtcState { blocks, trains, .. } = state;
    for train in trains.values_mut() {
        let id = train.id().clone();
        let Some(route) = train.route_mut() else {
            continue;
        };
        if route.line() != line || !route.is_active() {
            continue;
        }
        let sequence = route.block_sequence().to_vec();
        route.recalculate_lookahead(|number, index| {
            let block = blocks.get(&(line, number));
            let next_1 = sequence
                .get(index + 1)
                .and_then(|&next| blocks.get(&(line, next)));
            let next_2 = sequence
                .get(index + 2)
                .and_then(|&next| blocks.get(&(line, next)));
            match block {
                Some(block) => {
                    let authority = block.calculate_safe_authority(Some(&id));
                    let speed = block.calculate_suggested_speed(next_1, next_2);
                    (authority, speed)
                }
                None => (model::Authority::Denied, model::SpeedCommand::Stop),
            }
        });
    }
}
