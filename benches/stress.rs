use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ulid::Ulid;

use timetable::engine::{
    BookingRequest, Engine, EngineError, InMemoryStore, InstructorSelection, PostponeRequest,
};
use timetable::model::{Instructor, Room, Weekday};
use timetable::notice::NoticeHub;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

struct Campus {
    engine: Arc<Engine>,
    rooms: Vec<Ulid>,
    staff: Vec<Ulid>,
}

async fn setup(n_rooms: usize, n_staff: usize) -> Campus {
    let dir = std::env::temp_dir().join(format!("timetable_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(InMemoryStore::open(&dir.join("timetable.wal")).unwrap());
    let dept = Ulid::new();

    let mut rooms = Vec::new();
    for i in 0..n_rooms {
        let id = Ulid::new();
        store
            .upsert_room(Room {
                id,
                name: format!("R{}", 100 + i),
                department_id: dept,
                active: true,
            })
            .await
            .unwrap();
        rooms.push(id);
    }
    let mut staff = Vec::new();
    for i in 0..n_staff {
        let id = Ulid::new();
        store
            .upsert_instructor(Instructor {
                id,
                name: format!("Instructor {i}"),
                department_id: Some(dept),
            })
            .await
            .unwrap();
        staff.push(id);
    }
    println!("  created {n_rooms} rooms, {n_staff} instructors");

    let engine = Arc::new(Engine::with_store(store, Arc::new(NoticeHub::new())));
    Campus { engine, rooms, staff }
}

/// Half-hour slot `n` of a week, 08:00 to 20:00 each day.
fn slot(n: usize) -> (Weekday, String, String) {
    let day = Weekday::ALL[(n / 24) % Weekday::ALL.len()];
    let start = 8 * 60 + (n % 24) * 30;
    let end = start + 30;
    (
        day,
        format!("{:02}:{:02}", start / 60, start % 60),
        format!("{:02}:{:02}", end / 60, end % 60),
    )
}

fn request(room_id: Ulid, n: usize, instructors: InstructorSelection) -> BookingRequest {
    let (day, start, end) = slot(n);
    BookingRequest {
        room_id,
        department_id: None,
        day: day.to_string(),
        start,
        end,
        study_type: "morning".into(),
        stage: "third".into(),
        lecture_type: "practical".into(),
        section: None,
        group: None,
        subject: format!("Lecture {n}"),
        notes: None,
        instructors,
    }
}

async fn phase1_sequential(campus: &Campus) {
    let room = campus.rooms[0];
    let n = Weekday::ALL.len() * 24;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        campus
            .engine
            .create_booking(request(room, i, InstructorSelection::Unassigned))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_contended(campus: &Campus) {
    let n_tasks = 16;
    let per_task = 100;
    let committed = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for task in 0..n_tasks {
        let engine = campus.engine.clone();
        let rooms = campus.rooms[1..].to_vec();
        let staff = campus.staff.clone();
        let committed = committed.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..per_task {
                let room = rooms[(task + j) % rooms.len()];
                let instructor = staff[(task * 7 + j) % staff.len()];
                let req = request(room, j, InstructorSelection::Sole(instructor));
                match engine.create_booking(req).await {
                    Ok(_) => committed.fetch_add(1, Ordering::Relaxed),
                    Err(EngineError::Conflict { .. }) => conflicts.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * per_task;
    println!(
        "  {n_tasks} tasks x {per_task} requests = {total} in {:.2}s: {} committed, {} conflicts",
        elapsed.as_secs_f64(),
        committed.load(Ordering::Relaxed),
        conflicts.load(Ordering::Relaxed),
    );
}

async fn phase3_postpone_and_sweep(campus: &Campus) {
    let source = campus.rooms[0];
    let target = campus.rooms[campus.rooms.len() - 1];
    let originals = campus.engine.room_timetable(source, Some(Weekday::Monday)).await;

    let mut latencies = Vec::new();
    for (i, booking) in originals.iter().enumerate() {
        let (_, start, end) = slot(i);
        let t = Instant::now();
        let result = campus
            .engine
            .postpone(
                booking.id,
                PostponeRequest {
                    room_id: target,
                    date: "2026-10-17".into(),
                    start,
                    end,
                    reason: None,
                },
            )
            .await;
        if result.is_ok() {
            latencies.push(t.elapsed());
        }
    }
    print_latency("postpone latency", &mut latencies);

    let t = Instant::now();
    let report = campus
        .engine
        .reconcile(chrono::NaiveDate::from_ymd_opt(2026, 10, 19).unwrap())
        .await;
    println!(
        "  sweep reverted {} postponements in {:.2}ms",
        report.reverted,
        t.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    println!("=== timetable stress benchmark ===\n");

    println!("[setup]");
    let campus = setup(10, 24).await;

    println!("\n[phase 1] sequential booking throughput");
    phase1_sequential(&campus).await;

    println!("\n[phase 2] contended booking across rooms and instructors");
    phase2_contended(&campus).await;

    println!("\n[phase 3] postpone a day and sweep it back");
    phase3_postpone_and_sweep(&campus).await;

    println!("\n=== benchmark complete ===");
}
