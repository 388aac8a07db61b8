//! CTC coordinator: owns the shared state, wires the components together
//! and runs the per-second tick (scheduled closures, conflict detection,
//! emergency handling). The tick never sends periodic commands itself;
//! commands are event driven.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use model::{
    Authority, ClosureId, ClosureStatus, Route, RoutingStatus, SpeedCommand, Train, TrainId,
};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use track::{BlockNumber, Line, TrackLayout};
use utility::clock::Clock;

use crate::comm::CommunicationCore;
use crate::error::{BlockClosureConflict, CtcError};
use crate::events::{CtcEvent, EventBus, Warning, WarningKind};
use crate::failure::RerouteOutcome;
use crate::state::CtcState;
use crate::wayside::{ControllerId, WaysideController, WaysideRegistry};

const CONFLICT_HISTORY_LIMIT: usize = 100;
const REAR_END_WINDOW_BLOCKS: u16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    SameBlock,
    RearEnd,
    AuthorityViolation,
    MaintenanceViolation,
    SpeedViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    pub trains: Vec<TrainId>,
    pub line: Line,
    pub block: BlockNumber,
    pub detected_at: DateTime<Utc>,
}

/// The system value owning every component. No global state; collaborators
/// get events through the bus and the wayside talks to the communication
/// core.
#[derive(Clone)]
pub struct CtcSystem {
    state: Arc<Mutex<CtcState>>,
    comm: CommunicationCore,
    clock: Arc<dyn Clock>,
    events: EventBus,
    warnings: Arc<StdMutex<Vec<Warning>>>,
    conflict_history: Arc<StdMutex<Vec<Conflict>>>,
    cancel: CancellationToken,
}

impl CtcSystem {
    pub fn new(layout: TrackLayout, clock: Arc<dyn Clock>) -> Self {
        let layout = Arc::new(layout);
        let state = Arc::new(Mutex::new(CtcState::new(layout.clone())));
        let events = EventBus::default();
        let registry = WaysideRegistry::new(layout);
        let comm = CommunicationCore::new(state.clone(), registry, clock.clone(), events.clone());
        log::info!("CTC system initialized");
        Self {
            state,
            comm,
            clock,
            events,
            warnings: Arc::new(StdMutex::new(Vec::new())),
            conflict_history: Arc::new(StdMutex::new(Vec::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn communication(&self) -> &CommunicationCore {
        &self.comm
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CtcEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.comm.shutdown();
        log::info!("CTC system shutdown requested");
    }

    /// Registration passthrough for wayside peers.
    pub fn provide_wayside_controller(
        &self,
        controller: Arc<dyn WaysideController>,
        blocks_covered: Vec<bool>,
        red_line: bool,
    ) -> Result<ControllerId, CtcError> {
        Ok(self
            .comm
            .provide_wayside_controller(controller, blocks_covered, red_line)?)
    }

    // train lifecycle

    /// Creates a train on a line. Without an explicit id the per-line
    /// counter generates one (`R001`, `R002`, ...).
    pub async fn add_train(
        &self,
        line: Line,
        block: BlockNumber,
        id: Option<TrainId>,
    ) -> Result<TrainId, CtcError> {
        let mut state = self.state.lock().await;
        if state.block(line, block).is_none() {
            return Err(CtcError::UnknownBlock { line, block });
        }
        let id = match id {
            Some(id) => {
                if id.line() != line {
                    return Err(CtcError::TrainLineMismatch { id, line });
                }
                if state.trains.contains_key(&id) {
                    return Err(CtcError::DuplicateTrain(id));
                }
                state.claim_train_id(&id);
                id
            }
            None => state.generate_train_id(line)?,
        };
        state.trains.insert(id.clone(), Train::new(id.clone(), block));
        drop(state);
        self.events.publish(CtcEvent::TrainUpdated { train: id.clone() });
        log::info!("train {} added on {} line at block {}", id, line, block);
        Ok(id)
    }

    /// Removes a train, cancelling any in-flight departure sequence and
    /// releasing its route and id.
    pub async fn remove_train(&self, id: &TrainId) -> Result<(), CtcError> {
        self.comm.cancel_departure(id);
        let mut state = self.state.lock().await;
        let Some(mut train) = state.trains.remove(id) else {
            return Err(CtcError::UnknownTrain(id.clone()));
        };
        let now = self.clock.now();
        let line = train.line();
        let current = train.current_block();
        if let Some(block) = state.block_mut(line, current) {
            if block.occupying_train() == Some(id) {
                block.update_occupation(false, None, now);
            }
        }
        if let Some(mut route) = train.take_route() {
            let CtcState {
                blocks, routing, ..
            } = &mut *state;
            routing.release(blocks, &mut route, now);
        }
        state.release_train_id(id);
        state.failure.clear_stopped(id);
        drop(state);
        self.events.publish(CtcEvent::TrainRemoved { train: id.clone() });
        log::info!("train {} removed from system", id);
        Ok(())
    }

    pub async fn train_ids(&self) -> Vec<TrainId> {
        self.state.lock().await.trains.keys().cloned().collect()
    }

    // routing

    /// Generates and validates a route on a line.
    pub async fn generate_route(
        &self,
        line: Line,
        start: BlockNumber,
        end: BlockNumber,
        arrival: DateTime<Utc>,
    ) -> Result<Route, CtcError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let CtcState {
            layout,
            blocks,
            routing,
            ..
        } = &mut *state;
        Ok(routing.generate(layout, blocks, line, start, end, arrival, now)?)
    }

    /// Assigns and activates a route for a train, then sends the initial
    /// batched command for the line.
    pub async fn activate_route_for(
        &self,
        id: &TrainId,
        mut route: Route,
    ) -> Result<(), CtcError> {
        let now = self.clock.now();
        let line = route.line();
        {
            let mut state = self.state.lock().await;
            if !state.trains.contains_key(id) {
                return Err(CtcError::UnknownTrain(id.clone()));
            }
            {
                let CtcState {
                    blocks, routing, ..
                } = &mut *state;
                routing.activate(blocks, &mut route, id.clone(), now)?;
            }
            if let Some(train) = state.train_mut(id) {
                train.assign_route(route);
                train.set_routing_status(RoutingStatus::Active);
            }
            crate::comm::refresh_route_lookaheads(&mut state, line);
        }
        self.events.publish(CtcEvent::TrainUpdated { train: id.clone() });
        self.comm.send_updated_train_commands(line).await;
        log::info!("route activated for train {}", id);
        Ok(())
    }

    /// Starts the yard departure sequence for a routed train.
    pub async fn dispatch_from_yard(&self, id: &TrainId) -> Result<(), CtcError> {
        self.comm.send_departure_commands(id).await
    }

    /// Manual switch control: sets the position in the model and sends the
    /// full-line switch state to every controller on the line.
    pub async fn set_switch(
        &self,
        line: Line,
        block: BlockNumber,
        position: model::SwitchPosition,
    ) -> Result<(), CtcError> {
        {
            let mut state = self.state.lock().await;
            let Some(target) = state.block_mut(line, block) else {
                return Err(CtcError::UnknownBlock { line, block });
            };
            target.set_switch_position(position)?;
        }
        self.comm.command_switches(line).await;
        self.events.publish(CtcEvent::MapUpdated { line });
        Ok(())
    }

    // closures and failures

    /// Closes a block for maintenance immediately. Denied if the block is
    /// occupied or reserved by an active route.
    pub async fn close_block(&self, line: Line, block: BlockNumber) -> Result<(), CtcError> {
        {
            let mut state = self.state.lock().await;
            close_block_locked(&mut state, line, block)?;
        }
        self.comm.send_maintenance_closure(line, block, true).await;
        self.events.publish(CtcEvent::MapUpdated { line });
        Ok(())
    }

    /// Reopens a maintenance-closed block.
    pub async fn open_block(&self, line: Line, block: BlockNumber) -> Result<(), CtcError> {
        {
            let mut state = self.state.lock().await;
            open_block_locked(&mut state, line, block)?;
        }
        self.comm.send_maintenance_closure(line, block, false).await;
        self.events.publish(CtcEvent::MapUpdated { line });
        Ok(())
    }

    /// Schedules a closure (and its paired opening) for later execution by
    /// the tick loop.
    pub async fn schedule_block_closure(
        &self,
        line: Line,
        block: BlockNumber,
        at: DateTime<Utc>,
        duration: Duration,
    ) -> Result<ClosureId, CtcError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.block(line, block).is_none() {
            return Err(CtcError::UnknownBlock { line, block });
        }
        Ok(state
            .failure
            .schedule_closure(line, block, at, duration, now)?)
    }

    pub async fn cancel_block_closure(&self, id: &ClosureId) -> bool {
        self.state.lock().await.failure.cancel_closure(id)
    }

    pub async fn closure_status(&self, id: &ClosureId) -> Option<ClosureStatus> {
        self.state.lock().await.failure.closure_status(id)
    }

    /// Registers a block failure and emergency-stops every affected train.
    pub async fn add_failed_block(&self, line: Line, block: BlockNumber) -> Result<(), CtcError> {
        let now = self.clock.now();
        let to_stop = {
            let mut state = self.state.lock().await;
            let Some(target) = state.block_mut(line, block) else {
                return Err(CtcError::UnknownBlock { line, block });
            };
            target.set_failed(true);
            if !state.failure.add_failed_block(line, block, now) {
                return Ok(());
            }
            let affected = state.failure.find_affected_trains(&state.trains);
            for id in &affected {
                state.failure.mark_stopped(id.clone());
                if let Some(train) = state.train_mut(id) {
                    train.set_routing_status(RoutingStatus::Stopped);
                    train.set_commanded_speed(SpeedCommand::Stop);
                    train.set_authority(Authority::Denied);
                }
            }
            affected
        };
        for id in &to_stop {
            if let Err(why) = self.comm.stop_train(id).await {
                log::error!("failed to emergency-stop train {}: {}", id, why);
            }
        }
        let description = format!("Block {} on {} line failure detected", block, line);
        self.raise_warning(WarningKind::BlockFailure, description.clone(), now);
        self.events.publish(CtcEvent::EmergencyRaised { description });
        Ok(())
    }

    /// Registers a train failure and emergency-stops it.
    pub async fn add_failed_train(&self, id: &TrainId) -> Result<(), CtcError> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            if !state.trains.contains_key(id) {
                return Err(CtcError::UnknownTrain(id.clone()));
            }
            if !state.failure.add_failed_train(id.clone(), now) {
                return Ok(());
            }
            state.failure.mark_stopped(id.clone());
            if let Some(train) = state.train_mut(id) {
                train.set_routing_status(RoutingStatus::Stopped);
                train.set_commanded_speed(SpeedCommand::Stop);
                train.set_authority(Authority::Denied);
            }
        }
        if let Err(why) = self.comm.stop_train(id).await {
            log::error!("failed to emergency-stop train {}: {}", id, why);
        }
        let description = format!("Train {} malfunction detected", id);
        self.raise_warning(WarningKind::TrainFailure, description.clone(), now);
        self.events.publish(CtcEvent::EmergencyRaised { description });
        Ok(())
    }

    pub async fn find_affected_trains(&self) -> Vec<TrainId> {
        let state = self.state.lock().await;
        state.failure.find_affected_trains(&state.trains)
    }

    /// Attempts to reroute every train stopped because of a failure (never
    /// trains that failed themselves) around the failed blocks.
    pub async fn reroute_affected(&self) -> HashMap<TrainId, RerouteOutcome> {
        let now = self.clock.now();
        let mut outcomes = HashMap::new();
        let mut rerouted_lines = Vec::new();
        {
            let mut state = self.state.lock().await;
            let affected = state.failure.find_affected_trains(&state.trains);
            for id in affected {
                if state.failure.is_train_failed(&id) {
                    outcomes.insert(id, RerouteOutcome::TrainFailedNoReroute);
                    continue;
                }
                if !state.failure.was_stopped_by_failure(&id) {
                    outcomes.insert(id, RerouteOutcome::NotStopped);
                    continue;
                }
                let Some(train) = state.train(&id) else {
                    continue;
                };
                let Some(route) = train.route() else {
                    outcomes.insert(id, RerouteOutcome::NoRouteFound);
                    continue;
                };
                let line = route.line();
                let end = route.end_block();
                let arrival = route.scheduled_arrival();
                let start = train.current_block();
                let avoid = state.failure.failed_blocks_on(line);

                let alternative = {
                    let CtcState {
                        layout,
                        blocks,
                        routing,
                        ..
                    } = &mut *state;
                    routing
                        .find_alternative(layout, blocks, line, start, end, &avoid, arrival, now)
                        .into_iter()
                        .next()
                };
                match alternative {
                    Some(mut new_route) => {
                        // release the blocked plan, then reserve the new one
                        if let Some(mut old_route) =
                            state.train_mut(&id).and_then(|train| train.take_route())
                        {
                            let CtcState {
                                blocks, routing, ..
                            } = &mut *state;
                            routing.release(blocks, &mut old_route, now);
                        }
                        let activated = {
                            let CtcState {
                                blocks, routing, ..
                            } = &mut *state;
                            routing.activate(blocks, &mut new_route, id.clone(), now)
                        };
                        match activated {
                            Ok(()) => {
                                if let Some(train) = state.train_mut(&id) {
                                    train.assign_route(new_route);
                                    train.set_routing_status(RoutingStatus::Active);
                                }
                                state.failure.clear_stopped(&id);
                                rerouted_lines.push(line);
                                log::info!("train {} successfully rerouted", id);
                                outcomes.insert(id, RerouteOutcome::Rerouted);
                            }
                            Err(why) => {
                                log::warn!("reroute activation failed for {}: {}", id, why);
                                outcomes.insert(id, RerouteOutcome::NoRouteFound);
                            }
                        }
                    }
                    None => {
                        log::warn!("no alternative route found for train {}", id);
                        outcomes.insert(id, RerouteOutcome::NoRouteFound);
                    }
                }
            }
        }
        for line in rerouted_lines.into_iter().unique() {
            self.comm.send_updated_train_commands(line).await;
        }
        outcomes
    }

    // throughput

    pub async fn tickets_purchased(&self, line: Line, tickets: u32) {
        self.comm.tickets_purchased(line, tickets).await;
    }

    pub async fn throughput(&self, line: Line) -> u32 {
        self.state
            .lock()
            .await
            .throughput
            .get(&line)
            .copied()
            .unwrap_or(0)
    }

    // tick

    /// One coordination step at simulated time `now`: scheduled closures
    /// and openings are executed, then conflict detection runs over all
    /// trains. Critical conflicts emergency-stop the involved trains.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let mut closure_sends: Vec<(Line, BlockNumber, bool)> = Vec::new();
        let mut to_stop: Vec<TrainId> = Vec::new();
        let mut raised: Vec<Conflict> = Vec::new();

        {
            let mut state = self.state.lock().await;

            // promote due closures
            for closure in state.failure.due_closures(now) {
                match close_block_locked(&mut state, closure.line, closure.block) {
                    Ok(()) => {
                        state
                            .failure
                            .mark_closure(&closure.id, ClosureStatus::Active);
                        closure_sends.push((closure.line, closure.block, true));
                        log::info!(
                            "executed scheduled closure of block {} on {} line",
                            closure.block,
                            closure.line
                        );
                    }
                    Err(why) => {
                        state
                            .failure
                            .mark_closure(&closure.id, ClosureStatus::Failed);
                        self.raise_warning(
                            WarningKind::ClosureFailed,
                            format!(
                                "failed to close block {} on {} line: {}",
                                closure.block, closure.line, why
                            ),
                            now,
                        );
                    }
                }
            }

            // promote due openings
            for opening in state.failure.due_openings(now) {
                match open_block_locked(&mut state, opening.line, opening.block) {
                    Ok(()) => {
                        state
                            .failure
                            .mark_closure(&opening.closure_id, ClosureStatus::Completed);
                        closure_sends.push((opening.line, opening.block, false));
                        log::info!(
                            "executed scheduled opening of block {} on {} line",
                            opening.block,
                            opening.line
                        );
                    }
                    Err(why) => {
                        state.failure.drop_opening(&opening.closure_id);
                        log::error!(
                            "failed to open block {} on {} line: {}",
                            opening.block,
                            opening.line,
                            why
                        );
                    }
                }
            }

            // conflict detection
            let conflicts = detect_conflicts(&state, now);
            for conflict in conflicts {
                if conflict.severity == ConflictSeverity::Critical {
                    for id in &conflict.trains {
                        state.failure.mark_stopped(id.clone());
                        if let Some(train) = state.train_mut(id) {
                            train.set_routing_status(RoutingStatus::Stopped);
                            train.set_commanded_speed(SpeedCommand::Stop);
                            train.set_authority(Authority::Denied);
                        }
                        if !to_stop.contains(id) {
                            to_stop.push(id.clone());
                        }
                    }
                }
                raised.push(conflict);
            }
        }

        for (line, block, closed) in closure_sends {
            self.comm.send_maintenance_closure(line, block, closed).await;
            self.events.publish(CtcEvent::MapUpdated { line });
        }
        for id in &to_stop {
            if let Err(why) = self.comm.stop_train(id).await {
                log::error!("failed to emergency-stop train {}: {}", id, why);
            }
        }
        for conflict in raised {
            log::warn!(
                "conflict detected: {:?} on {} line block {} involving {:?}",
                conflict.kind,
                conflict.line,
                conflict.block,
                conflict.trains
            );
            self.raise_warning(
                WarningKind::Conflict,
                format!(
                    "{:?} conflict at block {} on {} line",
                    conflict.kind, conflict.block, conflict.line
                ),
                now,
            );
            let mut history = self.conflict_history.lock().unwrap();
            history.push(conflict);
            let overflow = history.len().saturating_sub(CONFLICT_HISTORY_LIMIT);
            if overflow > 0 {
                history.drain(..overflow);
            }
        }
    }

    /// Runs `tick` on a fixed real-time cadence until shutdown.
    pub fn spawn_tick_loop(&self, period: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let system = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = system.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let now = system.clock.now();
                        system.tick(now).await;
                    }
                }
            }
        })
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.warnings.lock().unwrap().clone()
    }

    pub fn conflict_history(&self) -> Vec<Conflict> {
        self.conflict_history.lock().unwrap().clone()
    }

    fn raise_warning(&self, kind: WarningKind, message: String, at: DateTime<Utc>) {
        let warning = Warning { kind, message, at };
        self.warnings.lock().unwrap().push(warning.clone());
        self.events.publish(CtcEvent::WarningRaised { warning });
    }

    #[doc(hidden)]
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut CtcState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }
}

fn close_block_locked(
    state: &mut CtcState,
    line: Line,
    block: BlockNumber,
) -> Result<(), CtcError> {
    let Some(target) = state.block(line, block) else {
        return Err(CtcError::UnknownBlock { line, block });
    };
    if target.occupied() {
        return Err(BlockClosureConflict::Occupied { line, block }.into());
    }
    if state.failure.is_block_closed(line, block) {
        return Err(BlockClosureConflict::AlreadyClosed { line, block }.into());
    }
    if let Some(route_id) = state.routing.reserved_by(line, block) {
        log::warn!(
            "closure of block {} on {} line denied: reserved by {}",
            block,
            line,
            route_id
        );
        return Err(BlockClosureConflict::Reserved { line, block }.into());
    }
    if let Some(target) = state.block_mut(line, block) {
        target.set_maintenance(true);
    }
    state.failure.add_maintenance_closure(line, block);
    log::info!("block {} on {} line closed for maintenance", block, line);
    Ok(())
}

fn open_block_locked(
    state: &mut CtcState,
    line: Line,
    block: BlockNumber,
) -> Result<(), CtcError> {
    if state.block(line, block).is_none() {
        return Err(CtcError::UnknownBlock { line, block });
    }
    if !state.failure.is_block_closed(line, block) {
        return Err(BlockClosureConflict::NotClosed { line, block }.into());
    }
    if let Some(target) = state.block_mut(line, block) {
        target.set_maintenance(false);
    }
    state.failure.remove_maintenance_closure(line, block);
    log::info!("block {} on {} line reopened", block, line);
    Ok(())
}

/// Coordinator-level conflict scan: same-block, rear-end, authority, and
/// maintenance plus speed-limit violations.
fn detect_conflicts(state: &CtcState, now: DateTime<Utc>) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    let stamp = now.timestamp();

    // trains sharing a non-yard block
    let mut by_block: HashMap<(Line, BlockNumber), Vec<&Train>> = HashMap::new();
    for train in state.trains.values() {
        by_block
            .entry((train.line(), train.current_block()))
            .or_default()
            .push(train);
    }
    for ((line, block), trains) in &by_block {
        if *block == 0 || trains.len() < 2 {
            continue;
        }
        conflicts.push(Conflict {
            id: format!("same_block_{}_{}_{}", line, block, stamp),
            kind: ConflictKind::SameBlock,
            severity: ConflictSeverity::Critical,
            trains: trains.iter().map(|train| train.id().clone()).collect(),
            line: *line,
            block: *block,
            detected_at: now,
        });
    }

    // faster train catching up within the rear-end window
    for line in state.layout.lines() {
        let mut on_line: Vec<&Train> = state
            .trains
            .values()
            .filter(|train| train.line() == line)
            .collect();
        on_line.sort_by_key(|train| train.current_block());
        for pair in on_line.windows(2) {
            let (follower, leader) = (pair[0], pair[1]);
            let gap = leader.current_block() - follower.current_block();
            if gap == 0 || gap > REAR_END_WINDOW_BLOCKS {
                continue;
            }
            if follower.speed_kmh() <= leader.speed_kmh() {
                continue;
            }
            let severity = if gap == 1 {
                ConflictSeverity::Critical
            } else {
                ConflictSeverity::High
            };
            conflicts.push(Conflict {
                id: format!(
                    "rear_end_{}_{}_{}",
                    follower.id(),
                    leader.id(),
                    stamp
                ),
                kind: ConflictKind::RearEnd,
                severity,
                trains: vec![follower.id().clone(), leader.id().clone()],
                line,
                block: follower.current_block(),
                detected_at: now,
            });
        }
    }

    for train in state.trains.values() {
        let line = train.line();
        let block = train.current_block();

        // moving without authority
        if train.authority() == Authority::Denied && train.speed_kmh() > 0.0 {
            conflicts.push(Conflict {
                id: format!("authority_{}_{}", train.id(), stamp),
                kind: ConflictKind::AuthorityViolation,
                severity: ConflictSeverity::High,
                trains: vec![train.id().clone()],
                line,
                block,
                detected_at: now,
            });
        }

        // sitting in a maintenance closure
        if state.failure.is_block_closed(line, block) {
            conflicts.push(Conflict {
                id: format!("maintenance_{}_{}", train.id(), stamp),
                kind: ConflictKind::MaintenanceViolation,
                severity: ConflictSeverity::High,
                trains: vec![train.id().clone()],
                line,
                block,
                detected_at: now,
            });
        }

        // more than 10% over the block's limit
        if let Some(current) = state.block(line, block) {
            let limit = current.speed_limit_kmh();
            if limit > 0.0 && train.speed_kmh() > limit * 1.1 {
                let severity = if train.speed_kmh() > limit * 1.3 {
                    ConflictSeverity::High
                } else {
                    ConflictSeverity::Medium
                };
                conflicts.push(Conflict {
                    id: format!("speed_{}_{}", train.id(), stamp),
                    kind: ConflictKind::SpeedViolation,
                    severity,
                    trains: vec![train.id().clone()],
                    line,
                    block,
                    detected_at: now,
                });
            }
        }
    }

    conflicts.sort_by(|a, b| b.severity.cmp(&a.severity));
    conflicts
}
