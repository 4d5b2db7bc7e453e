//! Loopback Capture
//!
//! This example runs a controller on the virtual bus in loopback mode:
//! - Initializing the controller with overrides
//! - Installing mask and range filters
//! - Capturing frames with zero-relative timestamps
//! - Sending classic, remote and FD frames

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use twai_utils::{decode_frame, InitOverrides, TimestampMode, Twai, VirtualDriver};

fn main() {
    // Initialize logging
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn run() -> twai_utils::Result<()> {
    let twai = Twai::new(Arc::new(VirtualDriver::new(1)));

    twai.initialize(
        0,
        &InitOverrides {
            bitrate: Some(500_000),
            loopback: Some(true),
            fd_bitrate: Some(2_000_000),
            ..InitOverrides::default()
        },
    )?;
    println!("{}", twai.describe(0)?);

    // Accept 0x123 exactly and anything in 0x200..=0x2FF
    twai.apply_filters(0, "123:7FF,200-2FF")?;
    twai.start_capture(0, TimestampMode::ZeroRelative)?;

    let frames = [
        "123#DEADBEEF",
        "124#01",          // filtered out
        "250#R4",
        "2A0##1000102030405060708090A0B",
        "12345678#1122",   // extended, filtered out
    ];
    for text in frames {
        let frame = decode_frame(text)?;
        twai.transmit_sync(0, &frame, Duration::from_secs(1))?;
        thread::sleep(Duration::from_millis(20));
    }

    // Let the consumer drain the ring
    thread::sleep(Duration::from_millis(200));
    twai.stop_capture(0)?;
    println!("Dropped frames: {}", twai.capture_dropped(0)?);

    twai.deinitialize(0)
}
