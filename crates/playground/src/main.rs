use std::sync::Arc;

use chrono::{Duration, Utc};
use ctc::testing::RecordingController;
use ctc::CtcSystem;
use track::{Line, TrackLayoutBuilder};
use utility::clock::{Clock, SimulatedClock};

/// Stands up a small green line with two wayside controllers, dispatches a
/// train from the yard and feeds a few occupancy updates, then dumps what
/// the wayside received.
#[tokio::main]
async fn main() {
    env_logger::init();

    let layout = TrackLayoutBuilder::new()
        .line(Line::Green, 151)
        .switch(Line::Green, 0, &[(0, 63)])
        .station(Line::Green, 66, 9, "Dormont")
        .station(Line::Green, 73, 12, "Mt Lebanon")
        .crossing(Line::Green, 19)
        .build();

    // simulation runs at 20x wall time
    let clock = Arc::new(SimulatedClock::new(Utc::now(), 20.0));
    let system = CtcSystem::new(layout, clock.clone());
    let _ticker = system.spawn_tick_loop(std::time::Duration::from_millis(250));

    let lower = RecordingController::new("Green-Lower");
    let upper = RecordingController::new("Green-Upper");
    let lower_mask: Vec<bool> = (0..151).map(|block| block <= 75).collect();
    let upper_mask: Vec<bool> = (0..151).map(|block| block > 75).collect();
    system
        .provide_wayside_controller(lower.clone(), lower_mask, false)
        .expect("lower controller registration");
    system
        .provide_wayside_controller(upper.clone(), upper_mask, false)
        .expect("upper controller registration");

    let train = system
        .add_train(Line::Green, 0, None)
        .await
        .expect("add train");
    let route = system
        .generate_route(Line::Green, 0, 73, clock.now() + Duration::hours(1))
        .await
        .expect("generate route");
    println!(
        "route {} over blocks {:?}",
        route.id(),
        &route.block_sequence()[..8.min(route.block_sequence().len())]
    );
    system
        .activate_route_for(&train, route)
        .await
        .expect("activate route");
    system
        .dispatch_from_yard(&train)
        .await
        .expect("dispatch from yard");

    // 8 simulated seconds pass in 400ms of wall time: the whole departure
    // sequence runs
    tokio::time::sleep(std::time::Duration::from_millis(600)).await;

    // the train reaches block 63, then 64
    for block in [63usize, 64] {
        let mut occupied = vec![false; 151];
        occupied[block] = true;
        system
            .communication()
            .update_occupied_blocks(occupied, "Green-Lower")
            .expect("occupancy update");
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    println!(
        "lower controller received {} command batches",
        lower.command_count()
    );
    if let Some(last) = lower.last_command() {
        let active: Vec<(usize, u16, u16)> = last
            .block_num
            .iter()
            .enumerate()
            .filter(|(_, &block)| block > 0)
            .map(|(index, &block)| (index, block, last.blocks_away[index]))
            .collect();
        println!("last batch (index, target, hops): {:?}", active);
        println!(
            "last batch as json: {}",
            serde_json::to_string(&last).expect("serialize batch")
        );
    }

    system.shutdown();
}
