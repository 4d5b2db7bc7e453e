//! TWAI configuration and status structures
//!
//! Driver configuration (GPIO assignment, bit timing, mode flags), the
//! acceptance filter descriptors, capture timestamp modes, and the
//! read-only controller snapshot shown by `info`.

use std::time::Duration;

use crate::constants::{
    DEFAULT_BITRATE, DEFAULT_CAPTURE_POLL_MS, DEFAULT_CAPTURE_QUEUE_DEPTH,
    DEFAULT_CAPTURE_STACK_SIZE, DEFAULT_FD_DATA_BITRATE, DEFAULT_FD_DATA_SSP_PERMILL,
    DEFAULT_RX_GPIO, DEFAULT_TX_GPIO, DEFAULT_TX_QUEUE_DEPTH, MAX_MASK_FILTERS,
    MAX_RANGE_FILTERS,
};

/// GPIO assignment of one controller
///
/// `None` marks an unconnected pin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoConfig {
    /// Transmit pin
    pub tx: Option<i32>,
    /// Receive pin
    pub rx: Option<i32>,
    /// Bit-quanta clock output pin
    pub quanta_clk_out: Option<i32>,
    /// Bus-off indicator pin
    pub bus_off_indicator: Option<i32>,
}

impl IoConfig {
    /// Check that both bus pins are assigned
    pub fn is_bus_connected(&self) -> bool {
        self.tx.is_some() && self.rx.is_some()
    }
}

/// Format a pin for display: "GPIO4" or "Disabled"
pub fn format_gpio_pin(pin: Option<i32>) -> String {
    match pin {
        Some(pin) if pin >= 0 => format!("GPIO{}", pin),
        _ => "Disabled".to_string(),
    }
}

/// Bit timing of one bus phase
///
/// Sample points of zero let the driver choose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitTiming {
    /// Bitrate in bits per second (0 disables the phase)
    pub bitrate: u32,
    /// Sample point (per mille)
    pub sp_permill: u16,
    /// Secondary sample point (per mille)
    pub ssp_permill: u16,
}

impl BitTiming {
    /// Create a timing with driver-chosen sample points
    pub fn new(bitrate: u32) -> Self {
        Self {
            bitrate,
            sp_permill: 0,
            ssp_permill: 0,
        }
    }
}

/// Operating mode flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeFlags {
    /// Acknowledge own frames (no other node required)
    pub self_test: bool,
    /// Receive own transmissions
    pub loopback: bool,
    /// Never drive the bus
    pub listen_only: bool,
    /// Drop received remote frames
    pub no_receive_rtr: bool,
}

/// Driver configuration of one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// GPIO assignment
    pub io: IoConfig,
    /// Clock source selector (0 = driver default)
    pub clk_src: u32,
    /// Arbitration phase timing
    pub bit_timing: BitTiming,
    /// FD data phase timing (bitrate 0 disables FD)
    pub data_timing: BitTiming,
    /// Automatic retransmissions (-1 = unlimited)
    pub fail_retry_cnt: i32,
    /// Driver transmit queue depth
    pub tx_queue_depth: u32,
    /// Interrupt priority (0 = driver default)
    pub intr_priority: i32,
    /// Mode flags
    pub flags: ModeFlags,
}

impl ControllerConfig {
    /// Startup configuration of `controller`
    ///
    /// Only controller 0 is wired to GPIO pins by default.
    pub fn default_for(controller: usize, fd_capable: bool) -> Self {
        let io = if controller == 0 {
            IoConfig {
                tx: Some(DEFAULT_TX_GPIO),
                rx: Some(DEFAULT_RX_GPIO),
                ..IoConfig::default()
            }
        } else {
            IoConfig::default()
        };
        let data_timing = if fd_capable {
            BitTiming {
                bitrate: DEFAULT_FD_DATA_BITRATE,
                sp_permill: 0,
                ssp_permill: DEFAULT_FD_DATA_SSP_PERMILL,
            }
        } else {
            BitTiming::default()
        };

        Self {
            io,
            clk_src: 0,
            bit_timing: BitTiming::new(DEFAULT_BITRATE),
            data_timing,
            fail_retry_cnt: -1,
            tx_queue_depth: DEFAULT_TX_QUEUE_DEPTH,
            intr_priority: 0,
            flags: ModeFlags::default(),
        }
    }

    /// Check if the FD data phase is enabled
    pub fn fd_enabled(&self) -> bool {
        self.data_timing.bitrate > 0
    }
}

/// Overrides applied by `initialize` onto the cached configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitOverrides {
    /// Arbitration bitrate
    pub bitrate: Option<u32>,
    /// Loopback mode (also enables self-test)
    pub loopback: Option<bool>,
    /// Listen-only mode
    pub listen_only: Option<bool>,
    /// FD data bitrate; FD-capable controllers fall back to the default rate
    pub fd_bitrate: Option<u32>,
}

/// Capture pipeline settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Ring capacity, fixed when capture starts
    pub queue_depth: usize,
    /// Bound on each consumer wait, and so on stop-signal latency
    pub poll_interval: Duration,
    /// How long `stop` waits for the consumer to exit
    pub stop_timeout: Duration,
    /// Consumer thread stack size in bytes
    pub stack_size: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        let poll_interval = Duration::from_millis(DEFAULT_CAPTURE_POLL_MS);
        Self {
            queue_depth: DEFAULT_CAPTURE_QUEUE_DEPTH,
            poll_interval,
            stop_timeout: poll_interval * 2,
            stack_size: DEFAULT_CAPTURE_STACK_SIZE,
        }
    }
}

/// Capture timestamp mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampMode {
    /// No timestamp prefix
    #[default]
    None,
    /// Capture time since the monotonic epoch
    Absolute,
    /// Time since the previous frame
    Delta,
    /// Time since capture start
    ZeroRelative,
}

impl TimestampMode {
    /// Selector character used on the console
    pub fn selector(self) -> char {
        match self {
            TimestampMode::None => 'n',
            TimestampMode::Absolute => 'a',
            TimestampMode::Delta => 'd',
            TimestampMode::ZeroRelative => 'z',
        }
    }
}

/// Mask acceptance filter: `(incoming & mask) == (id & mask)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskFilter {
    pub id: u32,
    pub mask: u32,
    /// Matches extended frames instead of standard ones
    pub extended: bool,
}

impl MaskFilter {
    /// Filter that never matches a valid identifier
    pub const CATCH_NONE: MaskFilter = MaskFilter {
        id: 0xFFFF_FFFF,
        mask: 0xFFFF_FFFF,
        extended: false,
    };

    /// Create a filter for standard frames
    pub fn new(id: u32, mask: u32) -> Self {
        Self {
            id,
            mask,
            extended: false,
        }
    }

    /// Create a filter for extended frames
    pub fn new_extended(id: u32, mask: u32) -> Self {
        Self {
            id,
            mask,
            extended: true,
        }
    }

    /// Check if a frame identifier passes this filter
    pub fn matches(&self, id: u32, extended: bool) -> bool {
        extended == self.extended && (id & self.mask) == (self.id & self.mask)
    }
}

/// Range acceptance filter: `low <= incoming <= high`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeFilter {
    pub low: u32,
    pub high: u32,
    /// Matches extended frames instead of standard ones
    pub extended: bool,
}

impl RangeFilter {
    /// Filter that never matches a valid identifier
    pub const CATCH_NONE: RangeFilter = RangeFilter {
        low: 0xFFFF_FFFF,
        high: 0xFFFF_FFFF,
        extended: false,
    };

    /// Create a filter for standard frames
    pub fn new(low: u32, high: u32) -> Self {
        Self {
            low,
            high,
            extended: false,
        }
    }

    /// Create a filter for extended frames
    pub fn new_extended(low: u32, high: u32) -> Self {
        Self {
            low,
            high,
            extended: true,
        }
    }

    /// Check if a frame identifier passes this filter
    pub fn matches(&self, id: u32, extended: bool) -> bool {
        extended == self.extended && (self.low..=self.high).contains(&id)
    }
}

/// Filter banks available on a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterCapacity {
    pub mask_filters: usize,
    pub range_filters: usize,
}

/// Parsed filter expression, bounded by the largest supported bank counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    pub masks: heapless::Vec<MaskFilter, MAX_MASK_FILTERS>,
    pub ranges: heapless::Vec<RangeFilter, MAX_RANGE_FILTERS>,
}

impl FilterSet {
    /// Check if the set accepts everything (no filter installed)
    pub fn is_accept_all(&self) -> bool {
        self.masks.is_empty() && self.ranges.is_empty()
    }
}

/// Bus error state reported by the transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    ErrorActive,
    ErrorWarning,
    ErrorPassive,
    BusOff,
    Stopped,
    Unknown,
}

impl BusState {
    /// Human-readable state name
    pub fn name(self) -> &'static str {
        match self {
            BusState::ErrorActive => "Error Active",
            BusState::ErrorWarning => "Error Warning",
            BusState::ErrorPassive => "Error Passive",
            BusState::BusOff => "Bus Off",
            BusState::Stopped => "Stopped",
            BusState::Unknown => "Unknown",
        }
    }
}

/// Bus state and error counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStatus {
    pub state: BusState,
    /// TX error counter
    pub tx_error_counter: u32,
    /// RX error counter
    pub rx_error_counter: u32,
}

/// Read-only snapshot of one controller for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    pub controller: usize,
    pub running: bool,
    pub capturing: bool,
    pub config: ControllerConfig,
    pub bus_status: Option<BusStatus>,
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "Enabled"
    } else {
        "Disabled"
    }
}

impl std::fmt::Display for ControllerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cfg = &self.config;
        writeln!(f, "========== TWAI{} Information ==========", self.controller)?;
        writeln!(
            f,
            "Status: {}",
            if self.running { "Running" } else { "Stopped" }
        )?;
        writeln!(
            f,
            "Capture: {}",
            if self.capturing { "Active" } else { "Idle" }
        )?;
        if let Some(status) = &self.bus_status {
            writeln!(f, "Bus State: {}", status.state.name())?;
            writeln!(f, "TX Error Counter: {}", status.tx_error_counter)?;
            writeln!(f, "RX Error Counter: {}", status.rx_error_counter)?;
        }

        writeln!(f, "\n--- GPIO Configuration ---")?;
        writeln!(f, "TX GPIO: {}", format_gpio_pin(cfg.io.tx))?;
        writeln!(f, "RX GPIO: {}", format_gpio_pin(cfg.io.rx))?;
        writeln!(
            f,
            "Clock Output GPIO: {}",
            format_gpio_pin(cfg.io.quanta_clk_out)
        )?;
        writeln!(
            f,
            "Bus Off Indicator GPIO: {}",
            format_gpio_pin(cfg.io.bus_off_indicator)
        )?;

        writeln!(f, "\n--- Timing Configuration ---")?;
        writeln!(f, "Arbitration Bitrate: {} bps", cfg.bit_timing.bitrate)?;
        writeln!(f, "Sample Point: {} per mille", cfg.bit_timing.sp_permill)?;
        writeln!(
            f,
            "Secondary Sample Point: {} per mille",
            cfg.bit_timing.ssp_permill
        )?;

        if cfg.fd_enabled() {
            writeln!(f, "\n--- TWAI-FD Configuration ---")?;
            writeln!(f, "Data Bitrate: {} bps", cfg.data_timing.bitrate)?;
            writeln!(
                f,
                "Data Sample Point: {} per mille",
                cfg.data_timing.sp_permill
            )?;
            writeln!(
                f,
                "Data Secondary Sample Point: {} per mille",
                cfg.data_timing.ssp_permill
            )?;
        }

        writeln!(f, "\n--- Driver Configuration ---")?;
        writeln!(f, "Clock Source: {}", cfg.clk_src)?;
        writeln!(f, "Fail Retry Count: {}", cfg.fail_retry_cnt)?;
        writeln!(f, "TX Queue Depth: {}", cfg.tx_queue_depth)?;
        writeln!(f, "Interrupt Priority: {}", cfg.intr_priority)?;

        writeln!(f, "\n--- Mode Flags ---")?;
        writeln!(f, "Self Test: {}", enabled(cfg.flags.self_test))?;
        writeln!(f, "Loopback: {}", enabled(cfg.flags.loopback))?;
        writeln!(f, "Listen Only: {}", enabled(cfg.flags.listen_only))?;
        writeln!(f, "No Receive RTR: {}", enabled(cfg.flags.no_receive_rtr))?;
        write!(f, "=====================================")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_controller_has_gpio() {
        let first = ControllerConfig::default_for(0, false);
        assert!(first.io.is_bus_connected());
        assert_eq!(first.bit_timing.bitrate, DEFAULT_BITRATE);
        assert!(!first.fd_enabled());

        let second = ControllerConfig::default_for(1, true);
        assert!(!second.io.is_bus_connected());
        assert!(second.fd_enabled());
    }

    #[test]
    fn test_format_gpio_pin() {
        assert_eq!(format_gpio_pin(Some(4)), "GPIO4");
        assert_eq!(format_gpio_pin(None), "Disabled");
        assert_eq!(format_gpio_pin(Some(-1)), "Disabled");
    }

    #[test]
    fn test_mask_filter_matching() {
        let filter = MaskFilter::new(0x123, 0x7F0);
        assert!(filter.matches(0x12A, false));
        assert!(!filter.matches(0x133, false));
        assert!(!filter.matches(0x123, true));

        assert!(!MaskFilter::CATCH_NONE.matches(0x7FF, false));
    }

    #[test]
    fn test_range_filter_matching() {
        let filter = RangeFilter::new(0xA, 0x15);
        assert!(filter.matches(0xA, false));
        assert!(filter.matches(0x15, false));
        assert!(!filter.matches(0x16, false));

        // Crossing 0x7FF keeps the frame format of the filter
        let crossing = RangeFilter::new(0x700, 0x900);
        assert!(crossing.matches(0x750, false));
        assert!(crossing.matches(0x7FF, false));
        assert!(!crossing.matches(0x750, true));

        let ext = RangeFilter::new_extended(0x100, 0x1000_0000);
        assert!(ext.extended);
        assert!(ext.matches(0x0ABC_DEF0, true));
        assert!(!ext.matches(0x200, false));
    }

    #[test]
    fn test_info_display() {
        let info = ControllerInfo {
            controller: 0,
            running: true,
            capturing: false,
            config: ControllerConfig::default_for(0, true),
            bus_status: Some(BusStatus {
                state: BusState::ErrorActive,
                tx_error_counter: 0,
                rx_error_counter: 0,
            }),
        };
        let text = info.to_string();
        assert!(text.contains("Status: Running"));
        assert!(text.contains("Arbitration Bitrate: 500000 bps"));
        assert!(text.contains("TX GPIO: GPIO4"));
        assert!(text.contains("Data Bitrate: 1000000 bps"));
        assert!(text.contains("Bus State: Error Active"));
    }
}
