use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Timelike, Utc};
use model::{Block, Route, RouteId, TrainId};
use track::{BlockNumber, Line, TrackLayout};

use crate::error::RouteInfeasible;

const CACHE_TTL_SECONDS: i64 = 30;

#[derive(Debug, Clone)]
struct CachedRoute {
    route: Route,
    cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RouteHistoryEntry {
    pub route_id: RouteId,
    pub train_id: Option<TrainId>,
    pub released_at: DateTime<Utc>,
}

/// Route generation, reservation and release. Routes are mutable while they
/// are being generated and effectively read only once activated.
pub struct RouteManager {
    cache: HashMap<(Line, BlockNumber, BlockNumber, u32), CachedRoute>,
    reservations: HashMap<(Line, BlockNumber), RouteId>,
    history: Vec<RouteHistoryEntry>,
    cache_hits: u64,
    generated: u64,
}

impl RouteManager {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
            reservations: HashMap::new(),
            history: Vec::new(),
            cache_hits: 0,
            generated: 0,
        }
    }

    /// Generates and validates a route. Requests for the same
    /// `(line, start, end, hour)` within the cache TTL reuse the cached
    /// sequence as long as all of its blocks are still operational.
    pub fn generate(
        &mut self,
        layout: &TrackLayout,
        blocks: &HashMap<(Line, BlockNumber), Block>,
        line: Line,
        start: BlockNumber,
        end: BlockNumber,
        arrival: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Route, RouteInfeasible> {
        let operational =
            |block: BlockNumber| -> bool { route_block_operational(blocks, line, block) };

        let cache_key = (line, start, end, arrival.hour());
        if let Some(cached) = self.cache.get(&cache_key) {
            let fresh = now - cached.cached_at < Duration::seconds(CACHE_TTL_SECONDS);
            let still_valid = cached
                .route
                .block_sequence()
                .iter()
                .all(|&block| operational(block));
            if fresh && still_valid {
                self.cache_hits += 1;
                log::debug!("returning cached route for {} {} -> {}", line, start, end);
                return Ok(cached.route.clone_with_arrival(arrival, now));
            }
            self.cache.remove(&cache_key);
        }

        let route = Route::create(layout, line, start, end, arrival, now).map_err(|why| {
            log::warn!("route generation failed: {}", why);
            RouteInfeasible::NoPath { line, start, end }
        })?;

        if !route.validate(layout, now, operational) {
            return Err(RouteInfeasible::ValidationFailed { line, start, end });
        }

        self.generated += 1;
        self.cache.insert(
            cache_key,
            CachedRoute {
                route: route.clone(),
                cached_at: now,
            },
        );
        log::info!("route generated: {}", route.id());
        Ok(route)
    }

    /// Reserves the route's blocks for the train and activates it. At most
    /// one reservation per block at a time.
    pub fn activate(
        &mut self,
        blocks: &mut HashMap<(Line, BlockNumber), Block>,
        route: &mut Route,
        train: TrainId,
        now: DateTime<Utc>,
    ) -> Result<(), RouteInfeasible> {
        let line = route.line();
        for &block in route.block_sequence() {
            if let Some(holder) = self.reservations.get(&(line, block)) {
                if holder != route.id() {
                    return Err(RouteInfeasible::BlockReserved { line, block });
                }
            }
        }
        for &block in route.block_sequence() {
            self.reservations.insert((line, block), route.id().clone());
        }

        // rough per-block occupation schedule from the departure time
        let departure = route.scheduled_departure().unwrap_or(now);
        let hop = per_hop_duration(route);
        for (index, &number) in route.block_sequence().iter().enumerate() {
            if let Some(block) = blocks.get_mut(&(line, number)) {
                block.schedule_occupation(departure + hop * index as i32);
            }
        }

        route.activate(train);
        log::info!("route {} activated for {:?}", route.id(), route.train_id());
        Ok(())
    }

    /// Candidate routes from start to end that avoid the given blocks,
    /// shortest first.
    pub fn find_alternative(
        &mut self,
        layout: &TrackLayout,
        blocks: &HashMap<(Line, BlockNumber), Block>,
        line: Line,
        start: BlockNumber,
        end: BlockNumber,
        avoid: &HashSet<BlockNumber>,
        arrival: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<Route> {
        let mut candidates = Vec::new();

        if let Ok(direct) = Route::create(layout, line, start, end, arrival, now) {
            candidates.push(direct);
        }
        // switch legs can bypass closed blocks on the monotonic path
        for candidate in switch_detours(layout, line, start, end, arrival, now) {
            candidates.push(candidate);
        }

        let mut alternatives: Vec<Route> = candidates
            .into_iter()
            .filter(|route| {
                route
                    .block_sequence()
                    .iter()
                    .all(|block| !avoid.contains(block))
            })
            .filter(|route| {
                route.validate(layout, now, |block| {
                    route_block_operational(blocks, line, block)
                })
            })
            .collect();
        alternatives.sort_by_key(|route| route.block_sequence().len());
        log::info!(
            "found {} alternative routes for {} {} -> {}",
            alternatives.len(),
            line,
            start,
            end
        );
        alternatives
    }

    /// Drops the route's reservations and deactivates it, leaving a history
    /// entry behind.
    pub fn release(
        &mut self,
        blocks: &mut HashMap<(Line, BlockNumber), Block>,
        route: &mut Route,
        now: DateTime<Utc>,
    ) {
        let line = route.line();
        self.reservations
            .retain(|(reserved_line, _), holder| !(*reserved_line == line && holder == route.id()));
        for &number in route.block_sequence() {
            if let Some(block) = blocks.get_mut(&(line, number)) {
                block.clear_scheduled_occupations();
            }
        }
        route.deactivate(now);
        self.history.push(RouteHistoryEntry {
            route_id: route.id().clone(),
            train_id: route.train_id().cloned(),
            released_at: now,
        });
        log::info!("route {} released", route.id());
    }

    pub fn reserved_by(&self, line: Line, block: BlockNumber) -> Option<&RouteId> {
        self.reservations.get(&(line, block))
    }

    pub fn history(&self) -> &[RouteHistoryEntry] {
        &self.history
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }
}

impl Default for RouteManager {
    fn default() -> Self {
        Self::new()
    }
}

fn route_block_operational(
    blocks: &HashMap<(Line, BlockNumber), Block>,
    line: Line,
    number: BlockNumber,
) -> bool {
    blocks
        .get(&(line, number))
        .map(|block| block.is_operational())
        .unwrap_or(false)
}

fn per_hop_duration(route: &Route) -> Duration {
    let hops = route.block_sequence().len().max(1) as i32;
    route.estimated_travel_time() / hops
}

/// Builds detour candidates that leave the monotonic path over one switch
/// leg and continue monotonically from the far side.
fn switch_detours(
    layout: &TrackLayout,
    line: Line,
    start: BlockNumber,
    end: BlockNumber,
    arrival: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Vec<Route> {
    let mut detours = Vec::new();
    let Ok(direct) = Route::create(layout, line, start, end, arrival, now) else {
        return detours;
    };
    for &block in direct.block_sequence() {
        let Some(track_block) = layout.block(line, block) else {
            continue;
        };
        let Some(switch) = &track_block.switch else {
            continue;
        };
        // the block the direct path enters after the switch; legs that just
        // reproduce the direct path are no detour
        let next_on_direct = direct
            .block_sequence()
            .iter()
            .skip_while(|&&b| b != block)
            .nth(1)
            .copied();
        for target in switch.destinations_from(block) {
            if target == end || Some(target) == next_on_direct {
                continue;
            }
            // prefix up to the switch, jump the leg, then monotonic to end
            let mut sequence: Vec<BlockNumber> = direct
                .block_sequence()
                .iter()
                .copied()
                .take_while(|&b| b != block)
                .collect();
            sequence.push(block);
            sequence.push(target);
            let mut cursor = target;
            let mut overran = false;
            while cursor != end {
                cursor = if end > cursor {
                    cursor + 1
                } else if cursor == 0 {
                    overran = true;
                    break;
                } else {
                    cursor - 1
                };
                if sequence.contains(&cursor) {
                    overran = true;
                    break;
                }
                sequence.push(cursor);
            }
            if overran {
                continue;
            }
            if let Ok(route) = Route::with_sequence(layout, line, sequence, arrival, now) {
                detours.push(route);
            }
        }
    }
    detours
}
