//! Performance benchmarks for the hot paths of the sync client

use client::log_buffer::{LogEntry, LogStreamBuffer, Severity};
use shared::{decode, route, AuthoritativeView, Envelope, ReadinessChange, ServerEvent, SessionSnapshot, Slot};
use std::time::Instant;

fn full_lobby(seats: u32) -> AuthoritativeView {
    AuthoritativeView::from_snapshot(SessionSnapshot {
        session_id: "lobby-1".to_string(),
        slots: (0..seats)
            .map(|i| Slot::human(i, &format!("player-{}", i), &format!("Player {}", i)))
            .collect(),
        ..SessionSnapshot::default()
    })
}

/// Benchmarks applying readiness events to a full lobby
#[test]
fn benchmark_route_readiness() {
    let mut view = full_lobby(16);
    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let event = ServerEvent::ReadinessChanged(ReadinessChange {
            index: i % 16,
            ready: i % 3 == 0,
        });
        view = route(&view, &event).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Route readiness: {} events in {:?} ({:.2} ns/event)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(view.slots().len(), 16);
    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks decoding of typical push frames
#[test]
fn benchmark_frame_decoding() {
    let frames = [
        r#"{"type":"readiness_changed","data":{"idx":3,"ready":true},"rev":41}"#,
        r#"{"type":"slot_updated","data":{"index":2,"kind":"human","ready":false,"connected":true,"player_id":"p2","name":"Bea"}}"#,
        r#"{"type":"log_line","data":{"text":"[INFO] Day 2 begins","timestamp":1700000000000}}"#,
        r#"{"type":"heartbeat_ack"}"#,
    ];

    let iterations = 50_000;
    let start = Instant::now();

    for i in 0..iterations {
        let envelope = decode(frames[i % frames.len()]).unwrap();
        assert!(!envelope.event.kind().is_empty());
    }

    let duration = start.elapsed();
    println!(
        "Frame decoding: {} frames in {:?} ({:.2} μs/frame)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks normalizing a large snapshot with duplicates and gaps
#[test]
fn benchmark_snapshot_normalization() {
    let mut slots: Vec<Slot> = (0..32)
        .filter(|i| i % 4 != 0)
        .map(|i| Slot::human(i, &format!("player-{}", i % 20), "P"))
        .collect();
    slots.reverse();
    let snapshot = SessionSnapshot {
        session_id: "lobby-1".to_string(),
        slots,
        ..SessionSnapshot::default()
    };

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let view = AuthoritativeView::from_snapshot(snapshot.clone());
        assert_eq!(view.slots().len(), 32);
    }

    let duration = start.elapsed();
    println!(
        "Snapshot normalization: {} snapshots in {:?} ({:.2} μs/snapshot)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}

/// Stress tests the log buffer under sustained overflow
#[test]
fn stress_test_log_buffer_overflow() {
    let mut buffer = LogStreamBuffer::new(500);
    let lines = 200_000;
    let start = Instant::now();

    for i in 0..lines {
        buffer.append(LogEntry::new(&format!("line {}", i), Severity::Info));
    }

    let duration = start.elapsed();
    println!("Log buffer: {} appends in {:?}", lines, duration);

    assert_eq!(buffer.len(), 500);
    assert_eq!(buffer.evicted(), (lines - 500) as u64);
    assert_eq!(buffer.entries().next().unwrap().text, "line 199500");
    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks encoding outbound-shaped envelopes back to the wire format
#[test]
fn benchmark_envelope_encoding() {
    let envelope = Envelope::with_rev(
        ServerEvent::ReadinessChanged(ReadinessChange {
            index: 7,
            ready: true,
        }),
        99,
    );

    let iterations = 50_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let raw = envelope.encode().unwrap();
        assert!(raw.starts_with('{'));
    }

    let duration = start.elapsed();
    println!(
        "Envelope encoding: {} envelopes in {:?}",
        iterations, duration
    );

    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}
