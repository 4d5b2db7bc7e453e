//! In-process simulated bus
//!
//! Every controller of a `VirtualDriver` sits on one shared bus. A frame
//! transmitted by an enabled controller is received by every other enabled
//! controller; in loopback mode the sender receives it as well. Acceptance
//! filtering happens in the receiver as on real hardware.
//!
//! The driver also carries the knobs the tests need: completion timing,
//! one-shot fault injection and frame injection that runs the receive
//! interrupt of a controller directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::{DriverCapabilities, EventHandler, SoftwareReceiver, TwaiDriver, TwaiSession};
use crate::constants::{
    DEFAULT_CONTROLLER_COUNT, VIRTUAL_MASK_FILTER_NUM, VIRTUAL_RANGE_FILTER_NUM,
};
use crate::error::{DriverError, DriverResult};
use crate::frame::TwaiFrame;
use crate::structures::{BusState, BusStatus, ControllerConfig, MaskFilter, RangeFilter};

/// When the virtual bus reports transmit completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Before `transmit` returns
    Immediate,
    /// From a helper thread after the given delay
    Delayed(Duration),
    /// Never; the frame stays pending forever
    Never,
}

/// Driver operation that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Open,
    Enable,
    Disable,
    Transmit,
    MaskFilter,
    RangeFilter,
}

struct BusInner {
    nodes: Vec<Option<Arc<VirtualSession>>>,
    faults: Vec<FaultPoint>,
    completion: CompletionMode,
    tx_log: Vec<(usize, TwaiFrame)>,
    sessions_opened: usize,
}

struct Bus {
    inner: Mutex<BusInner>,
}

impl Bus {
    /// Consume a pending fault for `point`
    fn take_fault(&self, point: FaultPoint) -> bool {
        let mut inner = self.inner.lock();
        match inner.faults.iter().position(|&p| p == point) {
            Some(pos) => {
                inner.faults.remove(pos);
                true
            }
            None => false,
        }
    }

    fn check_fault(&self, point: FaultPoint, operation: &'static str) -> DriverResult<()> {
        if self.take_fault(point) {
            debug!("Injected fault: {}", operation);
            return Err(DriverError::Rejected {
                operation,
                reason: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    fn node(&self, controller: usize) -> Option<Arc<VirtualSession>> {
        self.inner.lock().nodes.get(controller).cloned().flatten()
    }
}

/// Simulated multi-controller transceiver
pub struct VirtualDriver {
    bus: Arc<Bus>,
    capabilities: DriverCapabilities,
}

impl Default for VirtualDriver {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROLLER_COUNT)
    }
}

impl VirtualDriver {
    /// Create a bus with `controller_count` FD-capable controllers
    pub fn new(controller_count: usize) -> Self {
        Self::with_capabilities(DriverCapabilities {
            controller_count,
            mask_filters: VIRTUAL_MASK_FILTER_NUM,
            range_filters: VIRTUAL_RANGE_FILTER_NUM,
            supports_fd: true,
        })
    }

    /// Create a bus with explicit capabilities
    pub fn with_capabilities(capabilities: DriverCapabilities) -> Self {
        let bus = Bus {
            inner: Mutex::new(BusInner {
                nodes: vec![None; capabilities.controller_count],
                faults: Vec::new(),
                completion: CompletionMode::Immediate,
                tx_log: Vec::new(),
                sessions_opened: 0,
            }),
        };
        Self {
            bus: Arc::new(bus),
            capabilities,
        }
    }

    /// Choose how transmit completion is reported
    pub fn set_completion_mode(&self, mode: CompletionMode) {
        self.bus.inner.lock().completion = mode;
    }

    /// Make the next call of `point` fail
    pub fn fail_next(&self, point: FaultPoint) {
        self.bus.inner.lock().faults.push(point);
    }

    /// Run the receive interrupt of `controller` for `frame`
    ///
    /// Returns false when the controller is not enabled or the frame was
    /// filtered out.
    pub fn inject(&self, controller: usize, frame: &TwaiFrame) -> bool {
        match self.bus.node(controller) {
            Some(node) if node.is_enabled() => node.rx.deliver(frame),
            _ => false,
        }
    }

    /// Frames transmitted so far, with the sending controller
    pub fn transmitted(&self) -> Vec<(usize, TwaiFrame)> {
        self.bus.inner.lock().tx_log.clone()
    }

    /// Number of currently open sessions
    pub fn open_sessions(&self) -> usize {
        self.bus.inner.lock().nodes.iter().flatten().count()
    }

    /// Number of sessions ever opened
    pub fn sessions_opened(&self) -> usize {
        self.bus.inner.lock().sessions_opened
    }

    /// Check if `controller` has an enabled session
    pub fn is_enabled(&self, controller: usize) -> bool {
        self.bus
            .node(controller)
            .map(|node| node.is_enabled())
            .unwrap_or(false)
    }

    /// Configuration the open session of `controller` was created with
    pub fn session_config(&self, controller: usize) -> Option<ControllerConfig> {
        self.bus.node(controller).map(|node| node.config)
    }

    /// Mask filters installed on `controller`, in bank order
    pub fn installed_mask_filters(&self, controller: usize) -> Vec<MaskFilter> {
        self.bus
            .node(controller)
            .map(|node| node.rx.installed_masks())
            .unwrap_or_default()
    }

    /// Range filters installed on `controller`, in bank order
    pub fn installed_range_filters(&self, controller: usize) -> Vec<RangeFilter> {
        self.bus
            .node(controller)
            .map(|node| node.rx.installed_ranges())
            .unwrap_or_default()
    }
}

impl TwaiDriver for VirtualDriver {
    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn open_session(
        &self,
        controller: usize,
        config: &ControllerConfig,
    ) -> DriverResult<Arc<dyn TwaiSession>> {
        self.bus.check_fault(FaultPoint::Open, "open session")?;
        if config.fd_enabled() && !self.capabilities.supports_fd {
            return Err(DriverError::FdNotSupported);
        }

        let mut inner = self.bus.inner.lock();
        let slot = inner
            .nodes
            .get_mut(controller)
            .ok_or_else(|| DriverError::Rejected {
                operation: "open session",
                reason: format!("no controller {}", controller),
            })?;
        if slot.is_some() {
            return Err(DriverError::SessionBusy(controller));
        }

        let session = Arc::new(VirtualSession {
            controller,
            bus: Arc::downgrade(&self.bus),
            config: *config,
            enabled: AtomicBool::new(false),
            rx: SoftwareReceiver::new(
                self.capabilities.filter_capacity(),
                config.flags.no_receive_rtr,
            ),
        });
        *slot = Some(Arc::clone(&session));
        inner.sessions_opened += 1;
        debug!("Virtual controller {} opened", controller);
        Ok(session)
    }
}

/// One controller's session on the virtual bus
pub struct VirtualSession {
    controller: usize,
    bus: Weak<Bus>,
    config: ControllerConfig,
    enabled: AtomicBool,
    rx: SoftwareReceiver,
}

impl VirtualSession {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn bus(&self) -> DriverResult<Arc<Bus>> {
        self.bus.upgrade().ok_or(DriverError::Rejected {
            operation: "session",
            reason: "bus is gone".to_string(),
        })
    }

    fn require_disabled(&self, operation: &'static str) -> DriverResult<()> {
        if self.is_enabled() {
            return Err(DriverError::Rejected {
                operation,
                reason: "controller is running".to_string(),
            });
        }
        Ok(())
    }
}

impl TwaiSession for VirtualSession {
    fn register_callbacks(&self, handler: Arc<dyn EventHandler>) -> DriverResult<()> {
        self.rx.set_handler(handler);
        Ok(())
    }

    fn enable(&self) -> DriverResult<()> {
        self.bus()?.check_fault(FaultPoint::Enable, "enable")?;
        self.enabled.store(true, Ordering::Release);
        debug!("Virtual controller {} enabled", self.controller);
        Ok(())
    }

    fn disable(&self) -> DriverResult<()> {
        self.bus()?.check_fault(FaultPoint::Disable, "disable")?;
        self.enabled.store(false, Ordering::Release);
        debug!("Virtual controller {} disabled", self.controller);
        Ok(())
    }

    fn transmit(&self, frame: &TwaiFrame, timeout: Duration) -> DriverResult<()> {
        let bus = self.bus()?;
        bus.check_fault(FaultPoint::Transmit, "transmit")?;
        if !self.is_enabled() {
            return Err(DriverError::NotEnabled(self.controller));
        }
        if self.config.flags.listen_only {
            return Err(DriverError::Rejected {
                operation: "transmit",
                reason: "listen-only mode".to_string(),
            });
        }
        if frame.is_fd() && !self.config.fd_enabled() {
            return Err(DriverError::FdNotSupported);
        }

        let (receivers, completion) = {
            let mut inner = bus.inner.lock();
            inner.tx_log.push((self.controller, *frame));
            let receivers: Vec<Arc<VirtualSession>> = inner
                .nodes
                .iter()
                .flatten()
                .filter(|node| node.controller != self.controller && node.is_enabled())
                .filter(|node| !frame.is_fd() || node.config.fd_enabled())
                .cloned()
                .collect();
            (receivers, inner.completion)
        };
        trace!(
            "Virtual controller {} transmit {} (timeout {:?})",
            self.controller,
            frame,
            timeout
        );

        for node in &receivers {
            node.rx.deliver(frame);
        }
        if self.config.flags.loopback {
            self.rx.deliver(frame);
        }

        match completion {
            CompletionMode::Immediate => self.rx.complete_transmit(true),
            CompletionMode::Delayed(delay) => {
                let Some(node) = bus.node(self.controller) else {
                    return Ok(());
                };
                thread::Builder::new()
                    .name(format!("vtwai{}-txdone", self.controller))
                    .spawn(move || {
                        thread::sleep(delay);
                        node.rx.complete_transmit(true);
                    })
                    .map_err(|e| DriverError::Rejected {
                        operation: "transmit",
                        reason: e.to_string(),
                    })?;
            }
            CompletionMode::Never => {}
        }
        Ok(())
    }

    fn install_mask_filter(&self, index: usize, filter: &MaskFilter) -> DriverResult<()> {
        self.bus()?
            .check_fault(FaultPoint::MaskFilter, "install mask filter")?;
        self.require_disabled("install mask filter")?;
        self.rx.install_mask(index, filter)
    }

    fn install_range_filter(&self, index: usize, filter: &RangeFilter) -> DriverResult<()> {
        self.bus()?
            .check_fault(FaultPoint::RangeFilter, "install range filter")?;
        self.require_disabled("install range filter")?;
        self.rx.install_range(index, filter)
    }

    fn bus_status(&self) -> DriverResult<BusStatus> {
        let state = if self.is_enabled() {
            BusState::ErrorActive
        } else {
            BusState::Stopped
        };
        Ok(BusStatus {
            state,
            tx_error_counter: 0,
            rx_error_counter: 0,
        })
    }

    fn close(&self) -> DriverResult<()> {
        self.enabled.store(false, Ordering::Release);
        self.rx.clear_handler();
        match self.bus.upgrade() {
            Some(bus) => {
                let mut inner = bus.inner.lock();
                if let Some(slot) = inner.nodes.get_mut(self.controller) {
                    *slot = None;
                }
                debug!("Virtual controller {} closed", self.controller);
            }
            None => warn!("Virtual controller {} closed after its bus", self.controller),
        }
        Ok(())
    }
}
