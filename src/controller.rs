//! Controller state and lifecycle
//!
//! `Twai` owns one context per controller for the lifetime of the value.
//! A context is either uninitialized (no session) or running (open, enabled
//! session). Its capture pipeline and transmit coordinator are reachable
//! from the driver's interrupt context through `ControllerEvents`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::capture::{monotonic_us, CaptureState, LineSink, StdoutSink};
use crate::codec::parse_filters;
use crate::driver::{DriverCapabilities, EventHandler, FrameSource, TwaiDriver, TwaiSession};
use crate::error::{Result, TwaiError};
use crate::filter;
use crate::frame::TwaiFrame;
use crate::structures::{
    BitTiming, CaptureSettings, ControllerConfig, ControllerInfo, InitOverrides, TimestampMode,
};
use crate::transmit::TransmitState;

/// Interrupt-side state of one controller
struct ControllerEvents {
    capture: Arc<CaptureState>,
    transmit: TransmitState,
}

impl EventHandler for ControllerEvents {
    fn on_receive(&self, source: &dyn FrameSource) {
        self.capture.on_receive(source);
    }

    fn on_transmit_complete(&self, success: bool) {
        self.transmit.complete(success);
    }
}

/// Task-side state, guarded by the context lock
struct ControllerCore {
    config: ControllerConfig,
    default_config: ControllerConfig,
    session: Option<Arc<dyn TwaiSession>>,
}

struct ControllerContext {
    core: Mutex<ControllerCore>,
    /// Set iff `core.session` is Some
    is_initialized: AtomicBool,
    events: Arc<ControllerEvents>,
}

impl ControllerContext {
    fn new(config: ControllerConfig) -> Self {
        Self {
            core: Mutex::new(ControllerCore {
                config,
                default_config: config,
                session: None,
            }),
            is_initialized: AtomicBool::new(false),
            events: Arc::new(ControllerEvents {
                capture: Arc::new(CaptureState::new()),
                transmit: TransmitState::new(),
            }),
        }
    }

    fn is_initialized(&self) -> bool {
        self.is_initialized.load(Ordering::Acquire)
    }
}

/// TWAI controllers behind one driver
///
/// Every operation takes a controller id; an id outside
/// `0..controller_count()` fails with `InvalidArgument` and changes nothing.
pub struct Twai {
    driver: Arc<dyn TwaiDriver>,
    capabilities: DriverCapabilities,
    settings: CaptureSettings,
    sink: Arc<dyn LineSink>,
    controllers: Box<[ControllerContext]>,
}

impl Twai {
    /// Create the controller set of `driver` with default capture settings,
    /// printing captured frames to stdout
    pub fn new(driver: Arc<dyn TwaiDriver>) -> Self {
        Self::with_settings(driver, CaptureSettings::default(), Arc::new(StdoutSink))
    }

    /// Create the controller set of `driver`
    ///
    /// # Arguments
    /// * `driver` - Transceiver back-end
    /// * `settings` - Capture pipeline settings shared by all controllers
    /// * `sink` - Destination of capture lines
    pub fn with_settings(
        driver: Arc<dyn TwaiDriver>,
        settings: CaptureSettings,
        sink: Arc<dyn LineSink>,
    ) -> Self {
        // Fix the timestamp epoch outside interrupt context
        monotonic_us();
        let capabilities = driver.capabilities();
        let controllers = (0..capabilities.controller_count)
            .map(|id| {
                ControllerContext::new(ControllerConfig::default_for(id, capabilities.supports_fd))
            })
            .collect();
        debug!(
            "{} controller(s), {} mask / {} range filter bank(s), FD {}",
            capabilities.controller_count,
            capabilities.mask_filters,
            capabilities.range_filters,
            if capabilities.supports_fd { "supported" } else { "unsupported" }
        );
        Self {
            driver,
            capabilities,
            settings,
            sink,
            controllers,
        }
    }

    /// Number of controllers
    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    /// Capabilities of the underlying driver
    pub fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    /// Capture settings shared by all controllers
    pub fn capture_settings(&self) -> CaptureSettings {
        self.settings
    }

    fn context(&self, id: usize) -> Result<&ControllerContext> {
        self.controllers.get(id).ok_or(TwaiError::InvalidController {
            id,
            count: self.controllers.len(),
        })
    }

    /// Check if `id` has an open, enabled session
    pub fn is_initialized(&self, id: usize) -> Result<bool> {
        Ok(self.context(id)?.is_initialized())
    }

    /// Check if `id` is capturing frames
    pub fn is_capturing(&self, id: usize) -> Result<bool> {
        Ok(self.context(id)?.events.capture.is_running())
    }

    /// Frames dropped by the current (or last) capture of `id`
    pub fn capture_dropped(&self, id: usize) -> Result<u64> {
        Ok(self.context(id)?.events.capture.dropped())
    }

    /// Active configuration of `id`
    pub fn config(&self, id: usize) -> Result<ControllerConfig> {
        Ok(self.context(id)?.core.lock().config)
    }

    /// Replace the configuration of an uninitialized controller
    ///
    /// The startup configuration used by `reset` is not affected.
    pub fn set_config(&self, id: usize, config: ControllerConfig) -> Result<()> {
        let ctx = self.context(id)?;
        let mut core = ctx.core.lock();
        if ctx.is_initialized() {
            return Err(TwaiError::invalid_state(format!(
                "twai{}: configuration can only change while deinitialized",
                id
            )));
        }
        core.config = config;
        Ok(())
    }

    /// Open and enable `id` with `overrides` applied to its configuration
    ///
    /// A no-op when already initialized. On failure the controller stays
    /// uninitialized and its cached configuration is unchanged.
    pub fn initialize(&self, id: usize, overrides: &InitOverrides) -> Result<()> {
        let ctx = self.context(id)?;
        let mut core = ctx.core.lock();
        if ctx.is_initialized() {
            debug!("twai{}: already initialized", id);
            return Ok(());
        }

        let config = self.apply_overrides(id, core.config, overrides)?;
        self.open(id, ctx, &mut core, config)
    }

    fn apply_overrides(
        &self,
        id: usize,
        mut config: ControllerConfig,
        overrides: &InitOverrides,
    ) -> Result<ControllerConfig> {
        if let Some(bitrate) = overrides.bitrate {
            if bitrate == 0 {
                return Err(TwaiError::InvalidArgument(
                    "bitrate must be greater than 0".to_string(),
                ));
            }
            config.bit_timing = BitTiming::new(bitrate);
        }
        if let Some(loopback) = overrides.loopback {
            config.flags.loopback = loopback;
            config.flags.self_test = loopback;
        }
        if let Some(listen_only) = overrides.listen_only {
            config.flags.listen_only = listen_only;
        }
        if let Some(fd_bitrate) = overrides.fd_bitrate {
            if !self.capabilities.supports_fd {
                return Err(TwaiError::InvalidArgument(format!(
                    "twai{}: FD is not supported by this driver",
                    id
                )));
            }
            config.data_timing.bitrate = fd_bitrate;
        }
        if config.fd_enabled() && config.data_timing.bitrate < config.bit_timing.bitrate {
            warn!(
                "twai{}: FD data bitrate {} is below the arbitration bitrate {}, FD disabled",
                id, config.data_timing.bitrate, config.bit_timing.bitrate
            );
            config.data_timing = BitTiming::default();
        }
        Ok(config)
    }

    /// Open a session with `config`; the caller holds the context lock
    fn open(
        &self,
        id: usize,
        ctx: &ControllerContext,
        core: &mut ControllerCore,
        config: ControllerConfig,
    ) -> Result<()> {
        if !config.io.is_bus_connected() {
            return Err(TwaiError::InvalidArgument(format!(
                "twai{}: TX/RX GPIO not configured",
                id
            )));
        }

        let session = self.driver.open_session(id, &config)?;
        let handler: Arc<dyn EventHandler> = ctx.events.clone();
        let started = session
            .register_callbacks(handler)
            .and_then(|()| session.enable());
        if let Err(e) = started {
            if let Err(close_err) = session.close() {
                warn!("twai{}: cannot release failed session: {}", id, close_err);
            }
            return Err(e.into());
        }

        core.config = config;
        core.session = Some(session);
        ctx.is_initialized.store(true, Ordering::Release);
        info!(
            "twai{}: started at {} bps{}{}{}",
            id,
            config.bit_timing.bitrate,
            if config.fd_enabled() {
                format!(", FD data {} bps", config.data_timing.bitrate)
            } else {
                String::new()
            },
            if config.flags.loopback { ", loopback" } else { "" },
            if config.flags.listen_only { ", listen-only" } else { "" }
        );
        Ok(())
    }

    /// Disable and release the session of `id`
    ///
    /// Stops an active capture first. A no-op when not initialized.
    pub fn deinitialize(&self, id: usize) -> Result<()> {
        let ctx = self.context(id)?;
        let mut core = ctx.core.lock();
        self.close(id, ctx, &mut core)
    }

    /// Release the session; the caller holds the context lock
    fn close(&self, id: usize, ctx: &ControllerContext, core: &mut ControllerCore) -> Result<()> {
        let Some(session) = core.session.take() else {
            debug!("twai{}: not initialized", id);
            return Ok(());
        };
        if let Err(e) = ctx.events.capture.stop(id, self.settings.stop_timeout) {
            warn!("twai{}: {}", id, e);
        }
        ctx.is_initialized.store(false, Ordering::Release);

        let disabled = session.disable();
        let closed = session.close();
        if let Err(e) = &disabled {
            warn!("twai{}: disable failed: {}", id, e);
        }
        disabled.and(closed)?;
        info!("twai{}: stopped", id);
        Ok(())
    }

    /// Restore the startup configuration of `id`
    ///
    /// A running controller is stopped and started again with the restored
    /// configuration. If that restart fails the controller is left
    /// uninitialized.
    pub fn reset(&self, id: usize) -> Result<()> {
        let ctx = self.context(id)?;
        let mut core = ctx.core.lock();
        let was_running = ctx.is_initialized();

        if was_running {
            if let Err(e) = self.close(id, ctx, &mut core) {
                warn!("twai{}: {}", id, e);
            }
        }
        core.config = core.default_config;
        info!("twai{}: configuration reset to defaults", id);

        if was_running {
            let config = core.config;
            self.open(id, ctx, &mut core, config)?;
        }
        Ok(())
    }

    /// Snapshot of `id` for display
    pub fn describe(&self, id: usize) -> Result<ControllerInfo> {
        let ctx = self.context(id)?;
        let core = ctx.core.lock();
        let bus_status = core
            .session
            .as_ref()
            .and_then(|session| match session.bus_status() {
                Ok(status) => Some(status),
                Err(e) => {
                    debug!("twai{}: bus status unavailable: {}", id, e);
                    None
                }
            });
        Ok(ControllerInfo {
            controller: id,
            running: ctx.is_initialized(),
            capturing: ctx.events.capture.is_running(),
            config: core.config,
            bus_status,
        })
    }

    /// Send `frame` on `id` and wait up to `timeout` for its completion
    ///
    /// Fails with `InvalidState` when the controller is not running or when
    /// another transmission on it is still pending.
    pub fn transmit_sync(&self, id: usize, frame: &TwaiFrame, timeout: Duration) -> Result<()> {
        let ctx = self.context(id)?;
        let session = {
            let core = ctx.core.lock();
            let Some(session) = core.session.as_ref() else {
                return Err(TwaiError::invalid_state(format!(
                    "twai{}: not initialized",
                    id
                )));
            };
            if frame.is_fd() && !core.config.fd_enabled() {
                return Err(TwaiError::InvalidArgument(format!(
                    "twai{}: FD frame on a controller without FD enabled",
                    id
                )));
            }
            Arc::clone(session)
        };
        ctx.events
            .transmit
            .transmit(id, session.as_ref(), frame, timeout)
    }

    /// Parse `expression` and install it as the acceptance filters of `id`
    ///
    /// The expression is fully validated before the controller is touched.
    pub fn apply_filters(&self, id: usize, expression: &str) -> Result<()> {
        let ctx = self.context(id)?;
        let filters = parse_filters(expression, self.capabilities.filter_capacity())?;
        let core = ctx.core.lock();
        let Some(session) = core.session.as_ref() else {
            return Err(TwaiError::invalid_state(format!(
                "twai{}: not initialized",
                id
            )));
        };
        filter::apply(
            id,
            session.as_ref(),
            &filters,
            self.capabilities.filter_capacity(),
        )
    }

    /// Start capturing frames received on `id`
    pub fn start_capture(&self, id: usize, mode: TimestampMode) -> Result<()> {
        let ctx = self.context(id)?;
        let _core = ctx.core.lock();
        if !ctx.is_initialized() {
            return Err(TwaiError::invalid_state(format!(
                "twai{}: not initialized",
                id
            )));
        }
        ctx.events
            .capture
            .start(id, mode, &self.settings, Arc::clone(&self.sink))
    }

    /// Stop capturing on `id`, waiting for the consumer to exit
    pub fn stop_capture(&self, id: usize) -> Result<()> {
        let ctx = self.context(id)?;
        ctx.events.capture.stop(id, self.settings.stop_timeout)
    }
}

impl Drop for Twai {
    fn drop(&mut self) {
        for id in 0..self.controllers.len() {
            if let Err(e) = self.deinitialize(id) {
                warn!("twai{}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MemorySink;
    use crate::driver::{FaultPoint, VirtualDriver};
    use crate::ErrorKind;

    fn setup(count: usize) -> (Arc<VirtualDriver>, Twai) {
        let driver = Arc::new(VirtualDriver::new(count));
        let twai = Twai::with_settings(
            driver.clone(),
            CaptureSettings::default(),
            Arc::new(MemorySink::new()),
        );
        (driver, twai)
    }

    #[test]
    fn test_invalid_controller_id() {
        let (_driver, twai) = setup(2);
        let err = twai.initialize(2, &InitOverrides::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(twai.describe(7).is_err());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (driver, twai) = setup(1);
        twai.initialize(0, &InitOverrides::default()).unwrap();
        twai.initialize(0, &InitOverrides::default()).unwrap();
        assert_eq!(driver.sessions_opened(), 1);
        assert!(driver.is_enabled(0));
    }

    #[test]
    fn test_loopback_enables_self_test() {
        let (driver, twai) = setup(1);
        let overrides = InitOverrides {
            loopback: Some(true),
            ..InitOverrides::default()
        };
        twai.initialize(0, &overrides).unwrap();
        let config = driver.session_config(0).unwrap();
        assert!(config.flags.loopback);
        assert!(config.flags.self_test);
    }

    #[test]
    fn test_slow_fd_rate_disables_fd() {
        let (_driver, twai) = setup(1);
        let overrides = InitOverrides {
            bitrate: Some(1_000_000),
            fd_bitrate: Some(500_000),
            ..InitOverrides::default()
        };
        twai.initialize(0, &overrides).unwrap();
        assert!(!twai.config(0).unwrap().fd_enabled());
    }

    #[test]
    fn test_enable_failure_closes_session() {
        let (driver, twai) = setup(1);
        driver.fail_next(FaultPoint::Enable);
        let err = twai
            .initialize(0, &InitOverrides {
                bitrate: Some(250_000),
                ..InitOverrides::default()
            })
            .unwrap_err();
        assert!(err.is_driver_error());
        assert!(!twai.is_initialized(0).unwrap());
        assert_eq!(driver.open_sessions(), 0);
        assert_eq!(twai.config(0).unwrap().bit_timing.bitrate, 500_000);
    }

    #[test]
    fn test_missing_gpio_rejected() {
        let (driver, twai) = setup(2);
        let err = twai.initialize(1, &InitOverrides::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(driver.sessions_opened(), 0);
    }

    #[test]
    fn test_set_config_requires_deinitialized() {
        let (_driver, twai) = setup(1);
        let config = twai.config(0).unwrap();
        twai.initialize(0, &InitOverrides::default()).unwrap();
        let err = twai.set_config(0, config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        twai.deinitialize(0).unwrap();
        twai.set_config(0, config).unwrap();
    }

    #[test]
    fn test_deinitialize_stops_capture() {
        let (driver, twai) = setup(1);
        twai.initialize(0, &InitOverrides::default()).unwrap();
        twai.start_capture(0, TimestampMode::None).unwrap();
        twai.deinitialize(0).unwrap();
        assert!(!twai.is_capturing(0).unwrap());
        assert_eq!(driver.open_sessions(), 0);
        twai.deinitialize(0).unwrap();
    }

    #[test]
    fn test_reset_restarts_running_controller() {
        let (driver, twai) = setup(1);
        twai.initialize(0, &InitOverrides {
            bitrate: Some(125_000),
            ..InitOverrides::default()
        })
        .unwrap();
        twai.reset(0).unwrap();
        assert!(twai.is_initialized(0).unwrap());
        assert_eq!(driver.session_config(0).unwrap().bit_timing.bitrate, 500_000);
        assert_eq!(driver.sessions_opened(), 2);
    }

    #[test]
    fn test_failed_restart_leaves_controller_stopped() {
        let (driver, twai) = setup(1);
        twai.initialize(0, &InitOverrides::default()).unwrap();
        driver.fail_next(FaultPoint::Open);
        let err = twai.reset(0).unwrap_err();
        assert!(err.is_driver_error());
        assert!(!twai.is_initialized(0).unwrap());
    }

    #[test]
    fn test_operations_require_running_controller() {
        let (_driver, twai) = setup(1);
        let frame = TwaiFrame::with_data(0x1, false, &[]).unwrap();
        let err = twai
            .transmit_sync(0, &frame, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = twai.start_capture(0, TimestampMode::None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = twai.apply_filters(0, "123:7FF").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_fd_frame_on_stopped_classic_controller() {
        let driver = Arc::new(VirtualDriver::with_capabilities(DriverCapabilities {
            controller_count: 1,
            mask_filters: 3,
            range_filters: 1,
            supports_fd: false,
        }));
        let twai = Twai::with_settings(
            driver,
            CaptureSettings::default(),
            Arc::new(MemorySink::new()),
        );
        let frame = TwaiFrame::with_fd_data(0x1, false, &[1, 2], false).unwrap();
        let err = twai
            .transmit_sync(0, &frame, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        twai.initialize(0, &InitOverrides::default()).unwrap();
        let err = twai
            .transmit_sync(0, &frame, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_bad_filter_changes_nothing() {
        let (driver, twai) = setup(1);
        twai.initialize(0, &InitOverrides::default()).unwrap();
        let err = twai.apply_filters(0, "1:1,2:2,3:3,4:4").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(driver.installed_mask_filters(0).is_empty());
        assert!(driver.is_enabled(0));
    }

    #[test]
    fn test_describe_reports_bus_state() {
        let (_driver, twai) = setup(1);
        let info = twai.describe(0).unwrap();
        assert!(!info.running);
        assert!(info.bus_status.is_none());

        twai.initialize(0, &InitOverrides::default()).unwrap();
        let info = twai.describe(0).unwrap();
        assert!(info.running);
        assert!(info.bus_status.is_some());
        assert!(info.to_string().contains("Status: Running"));
    }
}
