//! Performance benchmarks for the tick pipeline

use shared::{
    wire::encode_frame, ArenaRules, ClientRequest, Event, EventQueue, GameState, Replica,
    ReplicaMessage, DEFAULT_LEVEL,
};
use std::sync::Arc;
use std::time::Instant;

fn replica() -> Replica {
    Replica::new(
        GameState::from_layout(DEFAULT_LEVEL).unwrap(),
        Arc::new(ArenaRules::default()),
    )
}

/// Benchmarks timer queue push and drain
#[test]
fn benchmark_event_queue() {
    let iterations = 100_000u64;
    let mut queue = EventQueue::new();
    let start = Instant::now();

    for i in 0..iterations {
        queue.push(i % 1_000, Event::BombExplode { bomb: i as u32 });
    }
    let mut drained = 0;
    for tick in 0..1_000 {
        drained += queue.pop_ready(tick).len();
    }

    let duration = start.elapsed();
    println!(
        "Event queue: {} events in {:?} ({:.2} ns/event)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(drained as u64, iterations);
    assert!(duration.as_millis() < 2_000);
}

/// Benchmarks leader ticks with a steady stream of requests
#[test]
fn benchmark_leader_simulation() {
    let ticks = 10_000u64;
    let mut leader = replica();
    let moves = [(1, 0), (-1, 0)];
    let start = Instant::now();

    let mut applied = 0;
    for tick in 1..=ticks {
        let (dx, dy) = moves[((tick / 25) % 2) as usize];
        let batch = leader.simulate(tick, vec![(2, ClientRequest::Move { dx, dy })]);
        applied += batch.len();
    }

    let duration = start.elapsed();
    println!(
        "Leader simulation: {} ticks in {:?} ({:.2} us/tick, {} events)",
        ticks,
        duration,
        duration.as_micros() as f64 / ticks as f64,
        applied
    );

    assert!(applied > 0);
    // 60 Hz leaves 16ms per tick; this is orders of magnitude below it
    assert!(duration.as_millis() < 2_000);
}

/// Benchmarks framing a typical replicated batch
#[test]
fn benchmark_batch_framing() {
    let iterations = 50_000;
    let message = ReplicaMessage::Event {
        tick: 1_234,
        data: vec![
            Event::PlayerMove {
                player: 1,
                dx: 1,
                dy: 0,
            },
            Event::BombSpawn {
                bomb: 7,
                x: 3,
                y: 2,
                owner: 2,
                explode_tick: 1_354,
            },
            Event::ExplosionRemove { explosion: 12 },
        ],
    };
    let start = Instant::now();

    let mut total = 0;
    for _ in 0..iterations {
        total += encode_frame(&message).unwrap().len();
    }

    let duration = start.elapsed();
    println!(
        "Batch framing: {} frames in {:?} ({:.2} ns/frame)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(total > 0);
    assert!(duration.as_millis() < 2_000);
}
