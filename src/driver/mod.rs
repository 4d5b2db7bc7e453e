//! Transceiver back-ends
//!
//! The controller layer talks to hardware only through these traits. A
//! driver opens one session per controller; the session reports received
//! frames and transmit completions to the `EventHandler` registered on it,
//! from whatever context the back-end treats as its interrupt context.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};

use crate::error::{DriverError, DriverResult};
use crate::frame::TwaiFrame;
use crate::structures::{BusStatus, ControllerConfig, FilterCapacity, MaskFilter, RangeFilter};

pub mod gs_usb;
pub mod virtual_bus;

pub use gs_usb::GsUsbDriver;
pub use virtual_bus::{CompletionMode, FaultPoint, VirtualDriver};

/// What a back-end offers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Number of independent controllers
    pub controller_count: usize,
    /// Mask filter banks per controller
    pub mask_filters: usize,
    /// Range filter banks per controller (0 when unsupported)
    pub range_filters: usize,
    /// FD frames supported
    pub supports_fd: bool,
}

impl DriverCapabilities {
    /// Filter banks per controller
    pub fn filter_capacity(&self) -> FilterCapacity {
        FilterCapacity {
            mask_filters: self.mask_filters,
            range_filters: self.range_filters,
        }
    }
}

/// Non-blocking access to the frame that raised a receive event
pub trait FrameSource {
    /// Take the pending received frame, if any
    ///
    /// Never blocks; safe to call from the back-end's interrupt context.
    fn receive_non_blocking(&self) -> Option<TwaiFrame>;
}

/// Hardware event callbacks, implemented once per controller
pub trait EventHandler: Send + Sync {
    /// A frame was received; read it through `source`
    fn on_receive(&self, source: &dyn FrameSource);

    /// The frame submitted by the last `transmit` left the controller
    fn on_transmit_complete(&self, success: bool);
}

/// An open controller session
pub trait TwaiSession: Send + Sync {
    /// Register the event callbacks of the owning controller
    fn register_callbacks(&self, handler: Arc<dyn EventHandler>) -> DriverResult<()>;

    /// Join the bus
    fn enable(&self) -> DriverResult<()>;

    /// Leave the bus; no events are raised while disabled
    fn disable(&self) -> DriverResult<()>;

    /// Queue a frame for transmission; completion is reported asynchronously
    fn transmit(&self, frame: &TwaiFrame, timeout: Duration) -> DriverResult<()>;

    /// Install a mask filter bank (controller must be disabled)
    fn install_mask_filter(&self, index: usize, filter: &MaskFilter) -> DriverResult<()>;

    /// Install a range filter bank (controller must be disabled)
    fn install_range_filter(&self, index: usize, filter: &RangeFilter) -> DriverResult<()>;

    /// Bus state and error counters
    fn bus_status(&self) -> DriverResult<BusStatus>;

    /// Release the session
    fn close(&self) -> DriverResult<()>;
}

/// A transceiver back-end
pub trait TwaiDriver: Send + Sync {
    /// Static description of the back-end
    fn capabilities(&self) -> DriverCapabilities;

    /// Open a session on `controller` with `config`
    fn open_session(
        &self,
        controller: usize,
        config: &ControllerConfig,
    ) -> DriverResult<Arc<dyn TwaiSession>>;
}

/// Receive path shared by the software back-ends
///
/// Holds the acceptance filter banks and a one-slot receive buffer. A
/// delivered frame is offered to the registered handler and released when
/// the handler returns, read or not, like a hardware RX buffer after its
/// interrupt.
pub(crate) struct SoftwareReceiver {
    slot: ArrayQueue<TwaiFrame>,
    isr: Mutex<()>,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
    masks: Mutex<Vec<Option<MaskFilter>>>,
    ranges: Mutex<Vec<Option<RangeFilter>>>,
    no_receive_rtr: bool,
}

impl SoftwareReceiver {
    pub(crate) fn new(capacity: FilterCapacity, no_receive_rtr: bool) -> Self {
        Self {
            slot: ArrayQueue::new(1),
            isr: Mutex::new(()),
            handler: RwLock::new(None),
            masks: Mutex::new(vec![None; capacity.mask_filters]),
            ranges: Mutex::new(vec![None; capacity.range_filters]),
            no_receive_rtr,
        }
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub(crate) fn clear_handler(&self) {
        *self.handler.write() = None;
    }

    pub(crate) fn install_mask(&self, index: usize, filter: &MaskFilter) -> DriverResult<()> {
        let mut masks = self.masks.lock();
        let available = masks.len();
        let bank = masks
            .get_mut(index)
            .ok_or(DriverError::FilterIndex { index, available })?;
        *bank = Some(*filter);
        Ok(())
    }

    pub(crate) fn install_range(&self, index: usize, filter: &RangeFilter) -> DriverResult<()> {
        let mut ranges = self.ranges.lock();
        let available = ranges.len();
        let bank = ranges
            .get_mut(index)
            .ok_or(DriverError::FilterIndex { index, available })?;
        *bank = Some(*filter);
        Ok(())
    }

    pub(crate) fn installed_masks(&self) -> Vec<MaskFilter> {
        self.masks.lock().iter().flatten().copied().collect()
    }

    pub(crate) fn installed_ranges(&self) -> Vec<RangeFilter> {
        self.ranges.lock().iter().flatten().copied().collect()
    }

    /// Hardware acceptance: no bank installed accepts everything
    pub(crate) fn accepts(&self, frame: &TwaiFrame) -> bool {
        let masks = self.masks.lock();
        let ranges = self.ranges.lock();
        let mut any_installed = false;
        for filter in masks.iter().flatten() {
            any_installed = true;
            if filter.matches(frame.id(), frame.is_extended()) {
                return true;
            }
        }
        for filter in ranges.iter().flatten() {
            any_installed = true;
            if filter.matches(frame.id(), frame.is_extended()) {
                return true;
            }
        }
        !any_installed
    }

    /// Run the receive interrupt for `frame`
    ///
    /// Returns false when the frame was filtered out.
    pub(crate) fn deliver(&self, frame: &TwaiFrame) -> bool {
        if (frame.is_remote() && self.no_receive_rtr) || !self.accepts(frame) {
            return false;
        }
        let _isr = self.isr.lock();
        let handler = self.handler.read().clone();
        self.slot.force_push(*frame);
        if let Some(handler) = handler {
            handler.on_receive(self);
        }
        while self.slot.pop().is_some() {}
        true
    }

    /// Run the transmit-complete interrupt
    pub(crate) fn complete_transmit(&self, success: bool) {
        let _isr = self.isr.lock();
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_transmit_complete(success);
        }
    }
}

impl FrameSource for SoftwareReceiver {
    fn receive_non_blocking(&self) -> Option<TwaiFrame> {
        self.slot.pop()
    }
}
