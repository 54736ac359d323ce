//! Stream 6DOF SLAM pose data from the XR50 to stdout.
//!
//! Usage: cargo run --example stream [mixed]
//! Press Ctrl+C to stop.

use std::time::{Duration, Instant};
use xr50::{SlamMode, StreamEvent, Xr50Error};

fn main() {
    env_logger::init();

    let mode = match std::env::args().nth(1).as_deref() {
        Some("mixed") => SlamMode::Mixed,
        _ => SlamMode::Edge,
    };

    let mut device = match xr50::Enumerator::new().and_then(|e| e.open_first()) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Failed to open device: {}", e);
            std::process::exit(1);
        }
    };

    println!("UUID:     {}", device.uuid());
    println!("Version:  {}", device.version());
    println!("Features: {:?}", device.features());
    println!();

    let mut stream = device.slam();
    let started = stream
        .on_event(|event| {
            if !matches!(event, StreamEvent::StateChanged(_)) {
                eprintln!("event: {:?}", event);
            }
        })
        .and_then(|()| stream.subscribe(1024));
    let poses = match started.and_then(|poses| stream.start(mode).map(|()| poses)) {
        Ok(poses) => poses,
        Err(e) => {
            eprintln!("Failed to start SLAM: {}", e);
            std::process::exit(1);
        }
    };

    println!("Streaming SLAM in {:?} mode (Ctrl+C to stop)...", mode);

    let start = Instant::now();
    let mut count: u64 = 0;
    let mut last_report = Instant::now();
    let mut last_pose = None;

    loop {
        match poses.recv_timeout(Duration::from_secs(2)) {
            Ok(p) => {
                count += 1;

                // Print every ~100th sample to avoid flooding the terminal
                if count % 100 == 1 {
                    let e = p.euler().to_degrees();
                    println!(
                        "ts={:<10}  pos=[{:+.4}, {:+.4}, {:+.4}]  quat=[{:+.3}, {:+.3}, {:+.3}, {:+.3}]  rpy=[{:+.1}, {:+.1}, {:+.1}]",
                        p.timestamp_us,
                        p.position[0], p.position[1], p.position[2],
                        p.orientation.w, p.orientation.x, p.orientation.y, p.orientation.z,
                        e[0], e[1], e[2],
                    );
                }

                let now = Instant::now();
                if now.duration_since(last_report) >= Duration::from_secs(3) {
                    let elapsed = start.elapsed().as_secs_f64();
                    let dt = last_pose.map(|prev| p.delta_us(&prev)).unwrap_or(0);
                    println!(
                        "--- {} samples in {:.1}s ({:.1} Hz, {} decoded, last gap {} us, {:?}) ---",
                        count,
                        elapsed,
                        count as f64 / elapsed,
                        stream.frame_count(),
                        dt,
                        stream.state(),
                    );
                    last_report = now;
                }
                last_pose = Some(p);
            }
            Err(Xr50Error::RecvTimeout) => {
                eprintln!("Timeout waiting for SLAM data");
                break;
            }
            Err(e) => {
                eprintln!("Stream ended: {} ({:?})", e, stream.end());
                break;
            }
        }
    }

    stream.stop();
    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "\nTotal: {} samples in {:.1}s ({:.1} Hz)",
        count,
        elapsed,
        count as f64 / elapsed
    );
}
