use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use pitchlock::model::*;
use pitchlock::notify::NotifyHub;
use pitchlock::Engine;

const DAY: Day = 20_100;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn bench_wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pitchlock_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("bench.wal")
}

fn request(field_id: Ulid, sub_field_id: Ulid, day: Day, start: Minute, end: Minute, tag: usize) -> ReservationRequest {
    ReservationRequest {
        field_id,
        day,
        ranges: vec![RangeRequest {
            sub_field_id,
            range: TimeRange::new(start, end),
            price_multiplier: 1.0,
        }],
        customer: Some(CustomerInfo {
            email: format!("bench{tag}@example.com"),
            name: format!("Bench {tag}"),
            phone: "010".into(),
        }),
        total_price_cents: 1_000 + tag as i64,
    }
}

async fn setup() -> (Arc<Engine>, Ulid, Vec<Ulid>) {
    let engine = Arc::new(Engine::new(bench_wal_path(), Arc::new(NotifyHub::new())).unwrap());
    let field_id = Ulid::new();
    engine.create_field(field_id, "Bench Complex").await.unwrap();

    let mut subs = Vec::new();
    for i in 0..10 {
        let sid = Ulid::new();
        engine.create_sub_field(sid, field_id, &format!("Pitch {i}")).await.unwrap();
        subs.push(sid);
    }
    (engine, field_id, subs)
}

/// Phase 1: sequential non-conflicting reserves on one sub-field.
async fn phase1_sequential(engine: &Arc<Engine>, field_id: Ulid, sub: Ulid) {
    let mut latencies = Vec::new();
    for i in 0..200usize {
        let day = DAY + (i / 20) as Day;
        let start = 360 + ((i % 20) as Minute) * 45;
        let t = Instant::now();
        engine
            .reserve(request(field_id, sub, day, start, start + 40, i))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    print_latency("sequential reserve", &mut latencies);
}

/// Phase 2: N tasks all racing for the exact same range — exactly one may win.
async fn phase2_single_slot_contention(engine: &Arc<Engine>, field_id: Ulid, sub: Ulid) {
    let n: usize = 100;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let t = Instant::now();
            let result = eng
                .reserve(request(field_id, sub, DAY + 100, 600, 660, 10_000 + i))
                .await;
            (t.elapsed(), result.is_ok())
        }));
    }

    let mut latencies = Vec::new();
    let mut wins = 0;
    for h in handles {
        let (lat, ok) = h.await.unwrap();
        latencies.push(lat);
        if ok {
            wins += 1;
        }
    }
    assert_eq!(wins, 1, "exactly one of {n} racing reservations may commit");
    print_latency(&format!("contended reserve ({n}-way, 1 winner)"), &mut latencies);
}

/// Phase 3: mixed load across sub-fields with overlapping random ranges.
async fn phase3_mixed(engine: &Arc<Engine>, field_id: Ulid, subs: &[Ulid]) {
    let n: usize = 500;
    let mut seed = 0x5EEDu64;
    let mut splitmix = move || {
        seed = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = seed;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    };

    let mut handles = Vec::new();
    for i in 0..n {
        let sub = subs[(splitmix() % subs.len() as u64) as usize];
        let start = 360 + (splitmix() % 960) as Minute;
        let duration = 30 * (1 + (splitmix() % 3) as Minute);
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let t = Instant::now();
            let result = eng
                .reserve(request(field_id, sub, DAY + 200, start, start + duration, 20_000 + i))
                .await;
            (t.elapsed(), result.is_ok())
        }));
    }

    let mut latencies = Vec::new();
    let mut committed = 0;
    for h in handles {
        let (lat, ok) = h.await.unwrap();
        latencies.push(lat);
        if ok {
            committed += 1;
        }
    }
    println!("  mixed: {committed}/{n} committed, rest conflicted");
    print_latency("mixed load reserve", &mut latencies);

    // Correctness under load: no sub-field schedule holds an overlap.
    for &sub in subs {
        let slots = engine.slots_on(sub, DAY + 200).await;
        for i in 0..slots.len() {
            for j in (i + 1)..slots.len() {
                assert!(
                    !slots[i].range.overlaps(&slots[j].range),
                    "double booking on {sub}"
                );
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    println!("pitchlock stress bench");
    let (engine, field_id, subs) = setup().await;

    println!("phase 1: sequential");
    phase1_sequential(&engine, field_id, subs[0]).await;

    println!("phase 2: single-slot contention");
    phase2_single_slot_contention(&engine, field_id, subs[1]).await;

    println!("phase 3: mixed load");
    phase3_mixed(&engine, field_id, &subs).await;

    println!("done");
}
