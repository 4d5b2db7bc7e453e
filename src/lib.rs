//! TWAI Utilities for Rust
//!
//! This crate provides the core of a console utility for TWAI (CAN / CAN FD)
//! controllers: controller lifecycle, synchronous transmission, interrupt-fed
//! frame capture, acceptance filter configuration, and the candump-style
//! text notation for frames and filters.
//!
//! # Features
//!
//! - Per-controller lifecycle (initialize, deinitialize, reset, describe)
//! - One in-flight transmission per controller with a bounded completion wait
//! - Frame capture through a lock-free bounded ring fed from interrupt context
//! - Mask and range acceptance filters
//! - Classic, remote and FD frame notation (`123#AABB`, `123#R`, `123##1AABB`)
//! - Virtual bus back-end and a GS-USB adapter back-end
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use twai_utils::{decode_frame, InitOverrides, TimestampMode, Twai, VirtualDriver};
//!
//! fn main() -> twai_utils::Result<()> {
//!     let twai = Twai::new(Arc::new(VirtualDriver::new(1)));
//!
//!     // Start controller 0 at 250 kbps in loopback mode
//!     twai.initialize(
//!         0,
//!         &InitOverrides {
//!             bitrate: Some(250_000),
//!             loopback: Some(true),
//!             ..InitOverrides::default()
//!         },
//!     )?;
//!
//!     // Print received frames with timestamps relative to capture start
//!     twai.start_capture(0, TimestampMode::ZeroRelative)?;
//!
//!     let frame = decode_frame("123#DEADBEEF")?;
//!     twai.transmit_sync(0, &frame, Duration::from_secs(1))?;
//!
//!     twai.stop_capture(0)?;
//!     twai.deinitialize(0)
//! }
//! ```

pub mod capture;
pub mod codec;
pub mod console;
pub mod constants;
pub mod controller;
pub mod driver;
pub mod error;
mod filter;
pub mod frame;
pub mod structures;
mod transmit;

// Re-export main types at crate root
pub use capture::{format_capture_line, LineSink, MemorySink, StdoutSink};
pub use codec::{
    decode_frame, encode_frame, parse_controller_selector, parse_filters, parse_timestamp_mode,
};
pub use console::{Console, ConsoleCommand};
pub use controller::Twai;
pub use driver::{
    CompletionMode, DriverCapabilities, FaultPoint, GsUsbDriver, TwaiDriver, TwaiSession,
    VirtualDriver,
};
pub use error::{DriverError, ErrorKind, ParseError, Result, TwaiError};
pub use frame::TwaiFrame;
pub use structures::{
    BusState, BusStatus, CaptureSettings, ControllerConfig, ControllerInfo, FilterSet,
    InitOverrides, MaskFilter, RangeFilter, TimestampMode,
};
