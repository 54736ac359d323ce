//! Stream 6DOF SLAM pose data as JSON lines.
//!
//! Outputs one JSON object per line at roughly 60 Hz:
//!
//! {"x":0.021,"y":0.002,"z":0.028,"roll":5.2,"pitch":3.1,"yaw":1.4,"t":1596314}
//!
//! Angles are in degrees, `t` is the device timestamp in microseconds.
//! The device is reopened automatically when the stream ends.
//!
//! Usage: cargo run --release --example stream_json

use std::io::{self, Write};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use xr50::{Enumerator, Pose, ReconnectPolicy, SlamMode, Supervisor};

const OUTPUT_INTERVAL: Duration = Duration::from_micros(16_667);

fn write_record(out: &mut impl Write, p: &Pose) -> io::Result<()> {
    let e = p.euler().to_degrees();
    writeln!(
        out,
        "{{\"x\":{:.4},\"y\":{:.4},\"z\":{:.4},\"roll\":{:.1},\"pitch\":{:.1},\"yaw\":{:.1},\"t\":{}}}",
        p.position[0], p.position[1], p.position[2], e[0], e[1], e[2], p.timestamp_us,
    )?;
    out.flush()
}

fn main() {
    env_logger::init();

    let enumerator = match Enumerator::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Failed to initialize libusb: {}", e);
            std::process::exit(1);
        }
    };

    // Never signalled: runs until killed.
    let (_shutdown_tx, shutdown) = crossbeam_channel::bounded::<()>(1);
    let last_write = Mutex::new(None::<Instant>);

    eprintln!("Streaming JSON (Ctrl+C to stop)...");
    let mut supervisor = Supervisor::new(enumerator, ReconnectPolicy::new(SlamMode::Edge));
    supervisor.run(&shutdown, move |pose| {
        let Ok(mut last) = last_write.lock() else {
            return;
        };
        let now = Instant::now();
        if last.is_some_and(|t| now.duration_since(t) < OUTPUT_INTERVAL) {
            return;
        }
        *last = Some(now);
        let stdout = io::stdout();
        let _ = write_record(&mut stdout.lock(), &pose);
    });
}
