//! Authority and speed safety kernel. One pure calculation over the locked
//! coordination state; both the batched line updates and the yard departure
//! sequence go through here so every command path applies the same rules.

use model::{Authority, Route, SpeedCommand, SwitchPosition, TrainId};
use track::BlockNumber;

use crate::state::CtcState;

/// Computes `(authority, speed)` for `train` being commanded into
/// `target` along `route`.
pub fn calculate(
    state: &CtcState,
    train: &TrainId,
    target: BlockNumber,
    route: &Route,
) -> (Authority, SpeedCommand) {
    let line = route.line();
    let Some(target_block) = state.block(line, target) else {
        log::warn!("block {} {} not found for safety calculation", line, target);
        return (Authority::Denied, SpeedCommand::Stop);
    };

    // occupation, failure, maintenance and crossing checks live on the block
    let mut authority = target_block.calculate_safe_authority(Some(train));

    if authority.granted() && bidirectional_conflict(state, train, target, route) {
        log::debug!(
            "train {} denied authority into {}: opposing traffic on bidirectional section",
            train,
            target
        );
        authority = Authority::Denied;
    }

    if authority.granted() && switch_conflict(state, target, route) {
        log::debug!(
            "train {} denied authority into {}: switch not aligned for route",
            train,
            target
        );
        authority = Authority::Denied;
    }

    if !authority.granted() {
        return (Authority::Denied, SpeedCommand::Stop);
    }

    let mut speed = SpeedCommand::Full;

    if let Some(hops) = nearest_stopped_train(state, train, target, route) {
        speed = speed.min(match hops {
            1 => SpeedCommand::Stop,
            2 => SpeedCommand::OneThird,
            _ => SpeedCommand::TwoThirds,
        });
    }

    if let Some(hops) = nearest_station(state, target, route) {
        speed = speed.min(match hops {
            1 => SpeedCommand::OneThird,
            _ => SpeedCommand::TwoThirds,
        });
    }

    if crossing_within_one_block(state, target, route) {
        speed = SpeedCommand::Stop;
    }

    (Authority::Granted, speed)
}

/// Direction of travel over `block` along `route`, inferred from the
/// ordering of the previous/next block numbers. `None` for single-block
/// routes.
fn travel_direction(route: &Route, block: BlockNumber) -> Option<bool> {
    let sequence = route.block_sequence();
    let index = route.index_of(block)?;
    if index > 0 {
        return Some(sequence[index - 1] < block);
    }
    sequence.get(index + 1).map(|&next| block < next)
}

/// Two trains on the same bidirectional block with opposing travel
/// directions conflict.
fn bidirectional_conflict(
    state: &CtcState,
    train: &TrainId,
    target: BlockNumber,
    route: &Route,
) -> bool {
    let Some(block) = state.block(route.line(), target) else {
        return false;
    };
    if !block.is_bidirectional() {
        return false;
    }
    let Some(own_direction) = travel_direction(route, target) else {
        return false;
    };
    for other in state.trains.values() {
        if other.id() == train {
            continue;
        }
        let Some(other_route) = other.route().filter(|route| route.is_active()) else {
            continue;
        };
        if other_route.line() != route.line() {
            continue;
        }
        // only trains that still have the block ahead of them oppose; a
        // train that already cleared it is out of the picture
        let still_ahead = other_route
            .index_of(target)
            .map_or(false, |index| index >= other_route.current_block_index());
        if !still_ahead {
            continue;
        }
        if let Some(other_direction) = travel_direction(other_route, target) {
            if other_direction != own_direction {
                return true;
            }
        }
    }
    false
}

/// Checks every switch crossed on the way from the current position to the
/// target: the required position is the higher-numbered connection iff the
/// route enters a higher-numbered block. A disagreeing reported position
/// collapses authority.
fn switch_conflict(state: &CtcState, target: BlockNumber, route: &Route) -> bool {
    let sequence = route.block_sequence();
    let Some(target_index) = route.index_of(target) else {
        return false;
    };
    let start = route.current_block_index();
    for index in (start + 1)..=target_index {
        let previous = sequence[index - 1];
        let entered = sequence[index];
        let Some(previous_block) = state.block(route.line(), previous) else {
            continue;
        };
        if !previous_block.has_switch() {
            continue;
        }
        let required = if entered > previous {
            SwitchPosition::Higher
        } else {
            SwitchPosition::Lower
        };
        if previous_block.switch_position() != required {
            return true;
        }
    }
    false
}

/// Route hops (1..=3) to the nearest stopped train ahead of `target`.
fn nearest_stopped_train(
    state: &CtcState,
    train: &TrainId,
    target: BlockNumber,
    route: &Route,
) -> Option<usize> {
    let sequence = route.block_sequence();
    let target_index = route.index_of(target)?;
    for hops in 1..=3usize {
        let Some(&ahead) = sequence.get(target_index + hops) else {
            break;
        };
        // block numbers repeat across lines, so only trains on this route's
        // line count
        let stopped_train_here = state.trains.values().any(|other| {
            other.id() != train
                && other.line() == route.line()
                && other.current_block() == ahead
                && other.is_stopped()
        });
        if stopped_train_here {
            return Some(hops);
        }
    }
    None
}

/// Route hops (1..=2) to the nearest station ahead of `target`.
fn nearest_station(state: &CtcState, target: BlockNumber, route: &Route) -> Option<usize> {
    let sequence = route.block_sequence();
    let target_index = route.index_of(target)?;
    for hops in 1..=2usize {
        let Some(&ahead) = sequence.get(target_index + hops) else {
            break;
        };
        if state
            .block(route.line(), ahead)
            .map(|block| block.has_station())
            .unwrap_or(false)
        {
            return Some(hops);
        }
    }
    None
}

fn crossing_within_one_block(state: &CtcState, target: BlockNumber, route: &Route) -> bool {
    let sequence = route.block_sequence();
    let Some(target_index) = route.index_of(target) else {
        return false;
    };
    for offset in 0..=1usize {
        let Some(&block_number) = sequence.get(target_index + offset) else {
            break;
        };
        if state
            .block(route.line(), block_number)
            .map(|block| block.crossing_active())
            .unwrap_or(false)
        {
            return true;
        }
    }
    false
}
