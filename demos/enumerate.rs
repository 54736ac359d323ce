//! List all connected XVisio XR50 devices.

fn main() {
    env_logger::init();

    let devices = xr50::Enumerator::new().and_then(|e| e.list_devices());
    match devices {
        Ok(devices) => {
            println!("Found {} XR50 device(s):", devices.len());
            for (i, dev) in devices.iter().enumerate() {
                println!(
                    "  [{}] UUID={}  FW={}  Features={:?}  At={}",
                    i, dev.uuid, dev.version, dev.features, dev.address
                );
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
