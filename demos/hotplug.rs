//! Watch for XR50 devices being plugged in and print their identity.
//!
//! Usage: cargo run --example hotplug

use std::time::Duration;

fn main() {
    env_logger::init();

    let mut enumerator = match xr50::Enumerator::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match enumerator.enumerate() {
        Ok(present) => println!("{} XR50 device(s) already connected", present.len()),
        Err(e) => eprintln!("Enumeration failed: {}", e),
    }

    if let Err(e) = enumerator.watch() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    println!("Waiting for devices (Ctrl+C to stop)...");

    loop {
        for device in enumerator.poll_new_devices() {
            println!(
                "Arrived at {}: UUID={} FW={} Features={:?}",
                device.address(),
                device.uuid(),
                device.version(),
                device.features()
            );
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
