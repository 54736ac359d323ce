//! Print detailed info about the first connected XR50 device.

fn main() {
    env_logger::init();

    match xr50::Enumerator::new().and_then(|e| e.open_first()) {
        Ok(device) => {
            println!("UUID:     {}", device.uuid());
            println!("Version:  {}", device.version());
            println!("Features: {:?}", device.features());
            println!("Address:  {}", device.address());
            println!();
            println!("Edge mode:    {}", device.supports_edge_mode());
            println!("Mixed mode:   {}", device.supports_mixed_mode());
            println!("Stereo:       {}", device.supports_stereo());
            println!("RGB:          {}", device.supports_rgb());
            println!("ToF:          {}", device.supports_tof());
            println!("Eye tracking: {}", device.supports_eye_tracking());
            println!("Face ID:      {}", device.supports_face_id());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
