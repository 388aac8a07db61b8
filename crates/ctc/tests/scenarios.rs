//! End-to-end scenarios: a system with registered recording controllers,
//! driven through registration, dispatch, occupancy updates, failures and
//! closures.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use ctc::testing::RecordingController;
use ctc::{CtcError, CtcSystem, ProtocolViolation};
use model::{ClosureStatus, TrainId};
use track::{Line, TrackLayout, TrackLayoutBuilder};
use utility::clock::{Clock, ManualClock};

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap()
}

fn green_layout() -> TrackLayout {
    TrackLayoutBuilder::new()
        .line(Line::Green, 151)
        .switch(Line::Green, 0, &[(0, 63)])
        .station(Line::Green, 66, 9, "Dormont")
        .build()
}

fn red_layout() -> TrackLayout {
    TrackLayoutBuilder::new().line(Line::Red, 77).build()
}

fn system_with(layout: TrackLayout) -> (CtcSystem, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(epoch()));
    let system = CtcSystem::new(layout, clock.clone());
    (system, clock)
}

fn full_mask(length: usize) -> Vec<bool> {
    vec![true; length]
}

fn range_mask(length: usize, range: std::ops::RangeInclusive<usize>) -> Vec<bool> {
    (0..length).map(|block| range.contains(&block)).collect()
}

async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", description);
}

async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
}

/// S1 / property 7: four departure commands, two simulated seconds apart,
/// commanding route blocks 1..=4 from the yard position.
#[tokio::test]
async fn yard_dispatch_on_green_line() {
    let (system, clock) = system_with(green_layout());
    let controller = RecordingController::new("Green-A");
    system
        .provide_wayside_controller(controller.clone(), full_mask(151), false)
        .unwrap();

    let id = system.add_train(Line::Green, 0, None).await.unwrap();
    assert_eq!(id.to_string(), "G001");
    let route = system
        .generate_route(Line::Green, 0, 66, epoch() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(&route.block_sequence()[..5], &[0, 63, 64, 65, 66]);
    system.activate_route_for(&id, route).await.unwrap();
    controller.clear();

    system.dispatch_from_yard(&id).await.unwrap();
    wait_until("first departure command", || controller.command_count() >= 1).await;
    for step in 2..=4usize {
        clock.advance(Duration::seconds(2));
        wait_until("next departure command", || {
            controller.command_count() >= step
        })
        .await;
    }
    settle().await;

    let commands = controller.commands();
    assert_eq!(commands.len(), 4, "exactly four departure commands");
    for (index, command) in commands.iter().enumerate() {
        assert_eq!(command.len(), 151);
        assert_eq!(command.block_num[0], 63 + index as u16);
        assert_eq!(command.blocks_away[0], index as u16 + 1);
        assert_eq!(command.next_station[0], 9);
        // everything beyond the yard position stays zero
        assert!(command.block_num[1..].iter().all(|&block| block == 0));
    }
    system.shutdown();
}

/// S2: an occupancy transition moves the train and triggers exactly one
/// batched command with the target four route hops ahead.
#[tokio::test]
async fn occupancy_driven_update_on_red_line() {
    let (system, _clock) = system_with(red_layout());
    let controller = RecordingController::new("Red-A");
    system
        .provide_wayside_controller(controller.clone(), full_mask(77), true)
        .unwrap();

    let id = system.add_train(Line::Red, 0, None).await.unwrap();
    let route = system
        .generate_route(Line::Red, 0, 9, epoch() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(route.block_sequence(), &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    system.activate_route_for(&id, route).await.unwrap();

    // walk the train forward to block 3
    for block in 1..=3usize {
        let mut occupied = vec![false; 77];
        occupied[block] = true;
        let before = controller.command_count();
        system
            .communication()
            .update_occupied_blocks(occupied, "Red-A")
            .unwrap();
        wait_until("batched command after movement", || {
            controller.command_count() > before
        })
        .await;
    }

    // train advances from block 3 to block 4
    let mut occupied = vec![false; 77];
    occupied[4] = true;
    let before = controller.command_count();
    system
        .communication()
        .update_occupied_blocks(occupied, "Red-A")
        .unwrap();
    wait_until("batched command for block 4", || {
        controller.command_count() > before
    })
    .await;

    let command = controller.last_command().unwrap();
    assert_eq!(command.block_num[4], 8, "target is four route hops ahead");
    assert_eq!(command.blocks_away[4], 4);
    assert_eq!(command.block_num[3], 0, "previous index is cleared");
    assert_eq!(command.suggested_speed[4], 3);
    assert_eq!(command.authority[4], 1);
    system.shutdown();
}

/// Property 3: unchanged line state triggers no further batched emissions.
#[tokio::test]
async fn change_detection_suppresses_identical_updates() {
    let (system, _clock) = system_with(red_layout());
    let controller = RecordingController::new("Red-A");
    system
        .provide_wayside_controller(controller.clone(), full_mask(77), true)
        .unwrap();

    let id = system.add_train(Line::Red, 0, None).await.unwrap();
    let route = system
        .generate_route(Line::Red, 0, 9, epoch() + Duration::hours(1))
        .await
        .unwrap();
    system.activate_route_for(&id, route).await.unwrap();
    controller.clear();

    let mut occupied = vec![false; 77];
    occupied[1] = true;

    // first delivery counts as a change
    system
        .communication()
        .update_occupied_blocks(occupied.clone(), "Red-A")
        .unwrap();
    wait_until("first batched emission", || controller.command_count() >= 1).await;

    // identical deliveries are suppressed
    for _ in 0..3 {
        system
            .communication()
            .update_occupied_blocks(occupied.clone(), "Red-A")
            .unwrap();
    }
    settle().await;
    assert_eq!(controller.command_count(), 1);

    // flipping one index triggers exactly one more emission
    occupied[2] = true;
    occupied[1] = false;
    system
        .communication()
        .update_occupied_blocks(occupied, "Red-A")
        .unwrap();
    wait_until("second batched emission", || controller.command_count() >= 2).await;
    settle().await;
    assert_eq!(controller.command_count(), 2);
    system.shutdown();
}

/// Near the route end the target clamps to the final block and the hop
/// count shrinks instead of running past the sequence.
#[tokio::test]
async fn target_clamps_at_route_end() {
    let (system, _clock) = system_with(red_layout());
    let controller = RecordingController::new("Red-A");
    system
        .provide_wayside_controller(controller.clone(), full_mask(77), true)
        .unwrap();

    let id = system.add_train(Line::Red, 0, None).await.unwrap();
    let route = system
        .generate_route(Line::Red, 0, 9, epoch() + Duration::hours(1))
        .await
        .unwrap();
    system.activate_route_for(&id, route).await.unwrap();

    // advance to block 7: two blocks short of the destination
    for block in [1usize, 2, 3, 4, 5, 6, 7] {
        let mut occupied = vec![false; 77];
        occupied[block] = true;
        let before = controller.command_count();
        system
            .communication()
            .update_occupied_blocks(occupied, "Red-A")
            .unwrap();
        wait_until("batched command", || controller.command_count() > before).await;
    }

    let command = controller.last_command().unwrap();
    assert_eq!(command.block_num[7], 9, "clamped to the final block");
    assert_eq!(command.blocks_away[7], 2);
    system.shutdown();
}

/// S3 / property 9: a failed block emergency-stops every train routed over
/// it, leaves other trains untouched, and reroute attempts are made only
/// for trains stopped by the failure.
#[tokio::test]
async fn failure_cascade_stops_and_classifies_trains() {
    let (system, _clock) = system_with(green_layout());
    let controller = RecordingController::new("Green-A");
    system
        .provide_wayside_controller(controller.clone(), full_mask(151), false)
        .unwrap();

    // G001 routed over block 70, G002 routed far away
    let riding = system.add_train(Line::Green, 0, None).await.unwrap();
    let route = system
        .generate_route(Line::Green, 0, 75, epoch() + Duration::hours(2))
        .await
        .unwrap();
    system.activate_route_for(&riding, route).await.unwrap();

    let elsewhere = system.add_train(Line::Green, 100, None).await.unwrap();
    let route = system
        .generate_route(Line::Green, 100, 110, epoch() + Duration::hours(2))
        .await
        .unwrap();
    system.activate_route_for(&elsewhere, route).await.unwrap();
    controller.clear();
    let mut events = system.subscribe();

    system.add_failed_block(Line::Green, 70).await.unwrap();

    let mut saw_emergency = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ctc::CtcEvent::EmergencyRaised { .. }) {
            saw_emergency = true;
        }
    }
    assert!(saw_emergency, "block failure raises an emergency event");
    assert!(system
        .warnings()
        .iter()
        .any(|warning| warning.kind == ctc::WarningKind::BlockFailure));

    let affected = system.find_affected_trains().await;
    assert!(affected.contains(&riding));
    assert!(!affected.contains(&elsewhere));

    // the emergency stop went out through the batched command path
    wait_until("emergency stop batch", || controller.command_count() >= 1).await;
    let stop = controller.commands().into_iter().next().unwrap();
    assert_eq!(stop.suggested_speed[0], 0);
    assert_eq!(stop.authority[0], 0);
    assert_eq!(stop.block_num[0], 0, "stop addressed at the yard position");

    // reroute attempted for the stopped train; the linear green line has no
    // way around block 70
    let outcomes = system.reroute_affected().await;
    assert_eq!(
        outcomes.get(&riding),
        Some(&ctc::RerouteOutcome::NoRouteFound)
    );
    assert!(!outcomes.contains_key(&elsewhere));
    system.shutdown();
}

/// Failed trains are never rerouted.
#[tokio::test]
async fn failed_trains_are_not_rerouted() {
    let (system, _clock) = system_with(green_layout());
    let controller = RecordingController::new("Green-A");
    system
        .provide_wayside_controller(controller.clone(), full_mask(151), false)
        .unwrap();

    let id = system.add_train(Line::Green, 0, None).await.unwrap();
    let route = system
        .generate_route(Line::Green, 0, 75, epoch() + Duration::hours(2))
        .await
        .unwrap();
    system.activate_route_for(&id, route).await.unwrap();

    system.add_failed_train(&id).await.unwrap();
    let outcomes = system.reroute_affected().await;
    assert_eq!(
        outcomes.get(&id),
        Some(&ctc::RerouteOutcome::TrainFailedNoReroute)
    );
    system.shutdown();
}

/// S5: every controller on the line receives the full line-length arrays.
#[tokio::test]
async fn full_line_fan_out_to_all_controllers() {
    let (system, _clock) = system_with(red_layout());
    let first = RecordingController::new("Red-A");
    let second = RecordingController::new("Red-B");
    let third = RecordingController::new("Red-C");
    system
        .provide_wayside_controller(first.clone(), range_mask(77, 0..=25), true)
        .unwrap();
    system
        .provide_wayside_controller(second.clone(), range_mask(77, 26..=50), true)
        .unwrap();
    system
        .provide_wayside_controller(third.clone(), range_mask(77, 51..=76), true)
        .unwrap();

    let id = system.add_train(Line::Red, 0, None).await.unwrap();
    let route = system
        .generate_route(Line::Red, 0, 20, epoch() + Duration::hours(1))
        .await
        .unwrap();
    system.activate_route_for(&id, route).await.unwrap();

    for controller in [&first, &second, &third] {
        wait_until("initial batch everywhere", || {
            controller.command_count() >= 1
        })
        .await;
        let command = controller.last_command().unwrap();
        assert_eq!(command.len(), 77);
        assert_eq!(command.suggested_speed.len(), 77);
        assert_eq!(command.blocks_away.len(), 77);
    }
    system.shutdown();
}

/// A failing controller send is logged and the rest of the batch goes out.
#[tokio::test]
async fn transient_send_failures_do_not_abort_the_batch() {
    let (system, _clock) = system_with(red_layout());
    let broken = RecordingController::new("Red-A");
    let healthy = RecordingController::new("Red-B");
    system
        .provide_wayside_controller(broken.clone(), range_mask(77, 0..=25), true)
        .unwrap();
    system
        .provide_wayside_controller(healthy.clone(), range_mask(77, 26..=76), true)
        .unwrap();
    broken.fail_sends(true);

    let id = system.add_train(Line::Red, 0, None).await.unwrap();
    let route = system
        .generate_route(Line::Red, 0, 9, epoch() + Duration::hours(1))
        .await
        .unwrap();
    system.activate_route_for(&id, route).await.unwrap();

    wait_until("healthy controller receives the batch", || {
        healthy.command_count() >= 1
    })
    .await;
    assert_eq!(broken.command_count(), 0);
    system.shutdown();
}

/// S6 / property 1: mismatched masks are rejected and leave no trace.
#[tokio::test]
async fn registration_rejection_leaves_registry_unchanged() {
    let (system, _clock) = system_with(red_layout());
    let controller = RecordingController::new("Red-A");
    let result =
        system.provide_wayside_controller(controller.clone(), full_mask(100), true);
    assert!(matches!(
        result,
        Err(CtcError::Protocol(
            ProtocolViolation::MaskLengthMismatch { expected: 77, got: 100, .. }
        ))
    ));
    assert!(system
        .communication()
        .controller_for_block(Line::Red, 0)
        .is_none());
    assert!(system.communication().controllers_on(Line::Red).is_empty());
    system.shutdown();
}

/// Inbound arrays from unknown senders or with wrong lengths are rejected
/// without touching state.
#[tokio::test]
async fn inbound_protocol_violations_are_rejected() {
    let (system, _clock) = system_with(red_layout());
    let controller = RecordingController::new("Red-A");
    system
        .provide_wayside_controller(controller.clone(), full_mask(77), true)
        .unwrap();

    assert!(matches!(
        system
            .communication()
            .update_occupied_blocks(vec![true; 77], "Red-Z"),
        Err(ProtocolViolation::UnknownSender(_))
    ));
    assert!(matches!(
        system
            .communication()
            .update_occupied_blocks(vec![true; 60], "Red-A"),
        Err(ProtocolViolation::ArrayLengthMismatch { got: 60, .. })
    ));
    settle().await;
    assert_eq!(controller.command_count(), 0);
    system.shutdown();
}

/// Property 8: scheduled closure and paired opening execute on the tick
/// that reaches their times, with the status walking
/// scheduled -> active -> completed.
#[tokio::test]
async fn closure_lifecycle_follows_the_clock() {
    let (system, clock) = system_with(red_layout());
    let controller = RecordingController::new("Red-A");
    system
        .provide_wayside_controller(controller.clone(), full_mask(77), true)
        .unwrap();

    let start = epoch() + Duration::hours(1);
    let closure = system
        .schedule_block_closure(Line::Red, 12, start, Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(
        system.closure_status(&closure).await,
        Some(ClosureStatus::Scheduled)
    );

    // before the start time nothing happens
    system.tick(clock.now()).await;
    assert_eq!(
        system.closure_status(&closure).await,
        Some(ClosureStatus::Scheduled)
    );
    assert_eq!(controller.occupations().len(), 0);

    // the tick at the start time closes the block
    clock.set(start);
    system.tick(clock.now()).await;
    assert_eq!(
        system.closure_status(&closure).await,
        Some(ClosureStatus::Active)
    );
    let occupations = controller.occupations();
    assert_eq!(occupations.len(), 1);
    assert!(occupations[0][12], "closed block forced occupied");

    // the tick past the end time opens it again
    clock.set(start + Duration::hours(1));
    system.tick(clock.now()).await;
    assert_eq!(
        system.closure_status(&closure).await,
        Some(ClosureStatus::Completed)
    );
    let occupations = controller.occupations();
    assert_eq!(occupations.len(), 2);
    assert!(!occupations[1][12], "opened block released");
    system.shutdown();
}

/// Closing an occupied block is denied with a reason.
#[tokio::test]
async fn closure_of_occupied_block_is_denied() {
    let (system, _clock) = system_with(red_layout());
    let controller = RecordingController::new("Red-A");
    system
        .provide_wayside_controller(controller.clone(), full_mask(77), true)
        .unwrap();

    let id = system.add_train(Line::Red, 0, None).await.unwrap();
    let route = system
        .generate_route(Line::Red, 0, 9, epoch() + Duration::hours(1))
        .await
        .unwrap();
    system.activate_route_for(&id, route).await.unwrap();

    let mut occupied = vec![false; 77];
    occupied[3] = true;
    system
        .communication()
        .update_occupied_blocks(occupied, "Red-A")
        .unwrap();
    wait_until("train on block 3", || controller.command_count() >= 2).await;

    let result = system.close_block(Line::Red, 3).await;
    assert!(matches!(
        result,
        Err(CtcError::Closure(
            ctc::BlockClosureConflict::Occupied { block: 3, .. }
        ))
    ));
    system.shutdown();
}

/// Property 10: generated ids count up per line and do not recycle.
#[tokio::test]
async fn train_id_generation_and_validation() {
    let (system, _clock) = system_with(red_layout());
    let first = system.add_train(Line::Red, 0, None).await.unwrap();
    let second = system.add_train(Line::Red, 0, None).await.unwrap();
    assert_eq!(first.to_string(), "R001");
    assert_eq!(second.to_string(), "R002");

    system.remove_train(&first).await.unwrap();
    let third = system.add_train(Line::Red, 0, None).await.unwrap();
    assert_eq!(third.to_string(), "R003", "released ids are not recycled");

    assert!("X001".parse::<TrainId>().is_err());
    assert!("R1".parse::<TrainId>().is_err());
    assert!("R0001".parse::<TrainId>().is_err());

    let duplicate = system
        .add_train(Line::Red, 0, Some("R002".parse().unwrap()))
        .await;
    assert!(matches!(duplicate, Err(CtcError::DuplicateTrain(_))));
    system.shutdown();
}

/// Removing a dispatched train cancels the rest of its departure sequence.
#[tokio::test]
async fn removing_a_train_cancels_its_departure_sequence() {
    let (system, clock) = system_with(green_layout());
    let controller = RecordingController::new("Green-A");
    system
        .provide_wayside_controller(controller.clone(), full_mask(151), false)
        .unwrap();

    let id = system.add_train(Line::Green, 0, None).await.unwrap();
    let route = system
        .generate_route(Line::Green, 0, 66, epoch() + Duration::hours(1))
        .await
        .unwrap();
    system.activate_route_for(&id, route).await.unwrap();
    controller.clear();

    system.dispatch_from_yard(&id).await.unwrap();
    wait_until("first departure command", || controller.command_count() >= 1).await;

    system.remove_train(&id).await.unwrap();
    clock.advance(Duration::seconds(10));
    settle().await;
    assert_eq!(
        controller.command_count(),
        1,
        "no further departure commands after removal"
    );
    system.shutdown();
}

/// Inbound switch and crossing reports fold into block state at the
/// sender's covered indices only.
#[tokio::test]
async fn switch_and_crossing_reports_update_block_state() {
    let layout = TrackLayoutBuilder::new()
        .line(Line::Red, 77)
        .switch(Line::Red, 5, &[(5, 6), (5, 12)])
        .switch(Line::Red, 40, &[(40, 41), (40, 55)])
        .crossing(Line::Red, 20)
        .build();
    let (system, _clock) = system_with(layout);
    let lower = RecordingController::new("Red-A");
    system
        .provide_wayside_controller(lower.clone(), range_mask(77, 0..=25), true)
        .unwrap();

    // switch 5 reported toward the higher leg; switch 40 is outside the
    // sender's coverage and must be ignored
    let mut positions = vec![false; 77];
    positions[5] = true;
    positions[40] = true;
    system
        .communication()
        .update_switch_positions(positions, "Red-A")
        .unwrap();

    let mut crossings = vec![false; 77];
    crossings[20] = true;
    system
        .communication()
        .update_railway_crossings(crossings, "Red-A")
        .unwrap();

    // the worker drains the queue in the background
    let mut folded = false;
    for _ in 0..300 {
        folded = system
            .with_state(|state| {
                let switched = state
                    .block(Line::Red, 5)
                    .map(|block| block.switch_position() == model::SwitchPosition::Higher)
                    .unwrap_or(false);
                let untouched = state
                    .block(Line::Red, 40)
                    .map(|block| block.switch_position() == model::SwitchPosition::Lower)
                    .unwrap_or(false);
                let crossing = state
                    .block(Line::Red, 20)
                    .map(|block| block.crossing_active())
                    .unwrap_or(false);
                switched && untouched && crossing
            })
            .await;
        if folded {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(folded, "switch and crossing reports were not applied");
    system.shutdown();
}

/// Manual switch commands fan the full-line position array out to the
/// wayside.
#[tokio::test]
async fn manual_switch_command_fans_out() {
    let layout = TrackLayoutBuilder::new()
        .line(Line::Red, 77)
        .switch(Line::Red, 5, &[(5, 6), (5, 12)])
        .build();
    let (system, _clock) = system_with(layout);
    let controller = RecordingController::new("Red-A");
    system
        .provide_wayside_controller(controller.clone(), full_mask(77), true)
        .unwrap();

    system
        .set_switch(Line::Red, 5, model::SwitchPosition::Higher)
        .await
        .unwrap();
    let sent = controller.switch_positions();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].len(), 77);
    assert!(sent[0][5]);
    assert!(!sent[0][6]);

    // blocks without a switch reject the operation
    let result = system
        .set_switch(Line::Red, 9, model::SwitchPosition::Higher)
        .await;
    assert!(matches!(result, Err(CtcError::BlockState(_))));
    system.shutdown();
}

/// Two trains reported in one block is a critical conflict: the tick
/// emergency-stops both and records the conflict.
#[tokio::test]
async fn tick_detects_same_block_conflicts() {
    let (system, clock) = system_with(red_layout());
    let controller = RecordingController::new("Red-A");
    system
        .provide_wayside_controller(controller.clone(), full_mask(77), true)
        .unwrap();

    let first = system.add_train(Line::Red, 10, None).await.unwrap();
    let second = system.add_train(Line::Red, 10, None).await.unwrap();

    system.tick(clock.now()).await;

    let history = system.conflict_history();
    assert!(history.iter().any(|conflict| {
        conflict.kind == ctc::ConflictKind::SameBlock
            && conflict.severity == ctc::ConflictSeverity::Critical
            && conflict.trains.contains(&first)
            && conflict.trains.contains(&second)
    }));
    assert_eq!(
        controller.command_count(),
        2,
        "one emergency stop per involved train"
    );
    assert!(system
        .warnings()
        .iter()
        .any(|warning| warning.kind == ctc::WarningKind::Conflict));
    system.shutdown();
}

/// Tickets only move the per-line counter.
#[tokio::test]
async fn throughput_counts_per_line() {
    let (system, _clock) = system_with(red_layout());
    system.tickets_purchased(Line::Red, 12).await;
    system.tickets_purchased(Line::Red, 5).await;
    assert_eq!(system.throughput(Line::Red).await, 17);
    assert_eq!(system.throughput(Line::Green).await, 0);
    system.shutdown();
}
