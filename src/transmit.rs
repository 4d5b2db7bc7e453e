//! Synchronous transmission
//!
//! One frame may be in flight per controller. The `pending` flag is claimed
//! before submission and released exactly once, either by the completion
//! callback or by the waiter giving up. Whichever side flips it from true to
//! false owns the outcome of that submission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace, warn};

use crate::driver::TwaiSession;
use crate::error::{DriverError, Result, TwaiError};
use crate::frame::TwaiFrame;

pub(crate) struct TransmitState {
    pending: AtomicBool,
    done_tx: Sender<bool>,
    done_rx: Receiver<bool>,
}

impl TransmitState {
    pub(crate) fn new() -> Self {
        let (done_tx, done_rx) = bounded(1);
        Self {
            pending: AtomicBool::new(false),
            done_tx,
            done_rx,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Completion callback; runs in the driver's interrupt context
    pub(crate) fn complete(&self, success: bool) {
        if self
            .pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Capacity 1 and a single owner of the flag: never full here
            let _ = self.done_tx.try_send(success);
        }
    }

    /// Submit `frame` and wait up to `timeout` for its completion
    ///
    /// # Arguments
    /// * `controller` - Controller id, for diagnostics
    /// * `session` - Open session of the controller
    /// * `frame` - Frame to send
    /// * `timeout` - Bound on the completion wait
    pub(crate) fn transmit(
        &self,
        controller: usize,
        session: &dyn TwaiSession,
        frame: &TwaiFrame,
        timeout: Duration,
    ) -> Result<()> {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TwaiError::invalid_state(format!(
                "twai{}: a transmission is already pending",
                controller
            )));
        }
        while self.done_rx.try_recv().is_ok() {}

        if let Err(e) = session.transmit(frame, timeout) {
            self.pending.store(false, Ordering::Release);
            warn!("twai{}: transmit of {} rejected: {}", controller, frame, e);
            return Err(e.into());
        }
        trace!("twai{}: submitted {}", controller, frame);

        let success = match self.done_rx.recv_timeout(timeout) {
            Ok(success) => success,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                if self
                    .pending
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    warn!("twai{}: transmit of {} timed out", controller, frame);
                    return Err(TwaiError::Timeout {
                        operation: "transmit",
                        timeout,
                    });
                }
                // The completion claimed the flag first; its signal is in flight
                self.done_rx
                    .recv_timeout(timeout)
                    .map_err(|_| TwaiError::Timeout {
                        operation: "transmit",
                        timeout,
                    })?
            }
        };

        if !success {
            return Err(DriverError::Rejected {
                operation: "transmit",
                reason: "frame was not acknowledged".to_string(),
            }
            .into());
        }
        debug!("twai{}: sent {}", controller, frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::EventHandler;
    use crate::error::DriverResult;
    use crate::structures::{BusState, BusStatus, MaskFilter, RangeFilter};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    /// Session whose completion is driven by the test
    struct ManualSession {
        reject: bool,
    }

    impl TwaiSession for ManualSession {
        fn register_callbacks(&self, _handler: Arc<dyn EventHandler>) -> DriverResult<()> {
            Ok(())
        }
        fn enable(&self) -> DriverResult<()> {
            Ok(())
        }
        fn disable(&self) -> DriverResult<()> {
            Ok(())
        }
        fn transmit(&self, _frame: &TwaiFrame, _timeout: Duration) -> DriverResult<()> {
            if self.reject {
                return Err(DriverError::TxQueueFull);
            }
            Ok(())
        }
        fn install_mask_filter(&self, _index: usize, _filter: &MaskFilter) -> DriverResult<()> {
            Ok(())
        }
        fn install_range_filter(&self, _index: usize, _filter: &RangeFilter) -> DriverResult<()> {
            Ok(())
        }
        fn bus_status(&self) -> DriverResult<BusStatus> {
            Ok(BusStatus {
                state: BusState::ErrorActive,
                tx_error_counter: 0,
                rx_error_counter: 0,
            })
        }
        fn close(&self) -> DriverResult<()> {
            Ok(())
        }
    }

    fn frame() -> TwaiFrame {
        TwaiFrame::with_data(0x123, false, &[1, 2, 3]).unwrap()
    }

    #[test]
    fn test_timeout_clears_pending() {
        let state = TransmitState::new();
        let session = ManualSession { reject: false };
        let timeout = Duration::from_millis(30);

        let started = Instant::now();
        let err = state.transmit(0, &session, &frame(), timeout).unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= timeout);
        assert!(!state.is_pending());
    }

    #[test]
    fn test_completion_wakes_waiter() {
        let state = Arc::new(TransmitState::new());
        let session = ManualSession { reject: false };

        let completer = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                while !state.is_pending() {
                    thread::yield_now();
                }
                thread::sleep(Duration::from_millis(5));
                state.complete(true);
            })
        };
        state
            .transmit(0, &session, &frame(), Duration::from_secs(5))
            .unwrap();
        completer.join().unwrap();
        assert!(!state.is_pending());
    }

    #[test]
    fn test_spurious_completion_is_ignored() {
        let state = TransmitState::new();
        state.complete(true);
        state.complete(true);
        assert!(state.done_rx.is_empty());
    }

    #[test]
    fn test_concurrent_transmit_fails_fast() {
        let state = TransmitState::new();
        state.pending.store(true, Ordering::Release);
        let session = ManualSession { reject: false };
        let err = state
            .transmit(0, &session, &frame(), Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidState);
        assert!(state.is_pending());
    }

    #[test]
    fn test_rejected_submission_releases_flag() {
        let state = TransmitState::new();
        let session = ManualSession { reject: true };
        let err = state
            .transmit(0, &session, &frame(), Duration::from_millis(10))
            .unwrap_err();
        assert!(err.is_driver_error());
        assert!(!state.is_pending());
    }

    #[test]
    fn test_failed_completion_is_a_driver_error() {
        let state = Arc::new(TransmitState::new());
        let session = ManualSession { reject: false };
        let completer = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                while !state.is_pending() {
                    thread::yield_now();
                }
                state.complete(false);
            })
        };
        let err = state
            .transmit(0, &session, &frame(), Duration::from_secs(5))
            .unwrap_err();
        completer.join().unwrap();
        assert!(err.is_driver_error());
    }
}
