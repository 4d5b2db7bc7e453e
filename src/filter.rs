//! Acceptance filter installation
//!
//! Filters can only be changed while the controller is off the bus. The
//! receive path is re-enabled after every attempt, successful or not.

use log::{debug, error, info};

use crate::driver::TwaiSession;
use crate::error::{DriverResult, Result};
use crate::structures::{FilterCapacity, FilterSet, MaskFilter, RangeFilter};

/// Install `filters` on `session`
///
/// Mask filters go first, then range filters. Unused banks get a catch-none
/// filter so a new expression fully replaces the previous one; with range
/// filters only this leaves the catch-none mask at index 0, so the default
/// mask bank no longer accepts everything.
///
/// # Arguments
/// * `controller` - Controller id, for diagnostics
/// * `session` - Open, enabled session
/// * `filters` - Parsed filter set; an empty set changes nothing
/// * `capacity` - Filter banks of the controller
pub(crate) fn apply(
    controller: usize,
    session: &dyn TwaiSession,
    filters: &FilterSet,
    capacity: FilterCapacity,
) -> Result<()> {
    if filters.is_accept_all() {
        debug!("twai{}: empty filter expression, filters unchanged", controller);
        return Ok(());
    }

    session.disable()?;
    let installed = install(session, filters, capacity);
    let enabled = session.enable();

    if let Err(e) = &installed {
        error!("twai{}: filter installation failed: {}", controller, e);
    }
    if let Err(e) = &enabled {
        error!("twai{}: cannot re-enable after filter change: {}", controller, e);
    }
    installed?;
    enabled?;

    info!(
        "twai{}: installed {} mask and {} range filter(s)",
        controller,
        filters.masks.len(),
        filters.ranges.len()
    );
    Ok(())
}

fn install(
    session: &dyn TwaiSession,
    filters: &FilterSet,
    capacity: FilterCapacity,
) -> DriverResult<()> {
    for index in 0..capacity.mask_filters {
        let filter = filters.masks.get(index).unwrap_or(&MaskFilter::CATCH_NONE);
        debug!(
            "mask filter {}: id 0x{:08X} mask 0x{:08X}{}",
            index,
            filter.id,
            filter.mask,
            if filter.extended { " (ext)" } else { "" }
        );
        session.install_mask_filter(index, filter)?;
    }
    for index in 0..capacity.range_filters {
        let filter = filters
            .ranges
            .get(index)
            .unwrap_or(&RangeFilter::CATCH_NONE);
        debug!(
            "range filter {}: 0x{:08X}-0x{:08X}{}",
            index,
            filter.low,
            filter.high,
            if filter.extended { " (ext)" } else { "" }
        );
        session.install_range_filter(index, filter)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_filters;
    use crate::driver::EventHandler;
    use crate::error::DriverError;
    use crate::frame::TwaiFrame;
    use crate::structures::{BusState, BusStatus};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Enable,
        Disable,
        Mask(usize, MaskFilter),
        Range(usize, RangeFilter),
    }

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<Call>>,
        fail_range: bool,
    }

    impl TwaiSession for Recording {
        fn register_callbacks(&self, _handler: Arc<dyn EventHandler>) -> DriverResult<()> {
            Ok(())
        }
        fn enable(&self) -> DriverResult<()> {
            self.calls.lock().push(Call::Enable);
            Ok(())
        }
        fn disable(&self) -> DriverResult<()> {
            self.calls.lock().push(Call::Disable);
            Ok(())
        }
        fn transmit(&self, _frame: &TwaiFrame, _timeout: Duration) -> DriverResult<()> {
            Ok(())
        }
        fn install_mask_filter(&self, index: usize, filter: &MaskFilter) -> DriverResult<()> {
            self.calls.lock().push(Call::Mask(index, *filter));
            Ok(())
        }
        fn install_range_filter(&self, index: usize, filter: &RangeFilter) -> DriverResult<()> {
            if self.fail_range {
                return Err(DriverError::FilterIndex {
                    index,
                    available: 0,
                });
            }
            self.calls.lock().push(Call::Range(index, *filter));
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

    const CAPACITY: FilterCapacity = FilterCapacity {
        mask_filters: 2,
        range_filters: 1,
    };

    #[test]
    fn test_masks_then_ranges_between_disable_and_enable() {
        let session = Recording::default();
        let filters = parse_filters("123:7FF,100-200", CAPACITY).unwrap();
        apply(0, &session, &filters, CAPACITY).unwrap();
        assert_eq!(
            *session.calls.lock(),
            vec![
                Call::Disable,
                Call::Mask(0, MaskFilter::new(0x123, 0x7FF)),
                Call::Mask(1, MaskFilter::CATCH_NONE),
                Call::Range(0, RangeFilter::new(0x100, 0x200)),
                Call::Enable,
            ]
        );
    }

    #[test]
    fn test_range_only_puts_catch_none_at_mask_zero() {
        let session = Recording::default();
        let filters = parse_filters("10-20", CAPACITY).unwrap();
        apply(0, &session, &filters, CAPACITY).unwrap();
        let calls = session.calls.lock();
        assert_eq!(calls[1], Call::Mask(0, MaskFilter::CATCH_NONE));
    }

    #[test]
    fn test_failure_still_reenables() {
        let session = Recording {
            fail_range: true,
            ..Recording::default()
        };
        let filters = parse_filters("10-20", CAPACITY).unwrap();
        let err = apply(0, &session, &filters, CAPACITY).unwrap_err();
        assert!(err.is_driver_error());
        assert_eq!(session.calls.lock().last(), Some(&Call::Enable));
    }

    #[test]
    fn test_empty_set_touches_nothing() {
        let session = Recording::default();
        apply(0, &session, &FilterSet::default(), CAPACITY).unwrap();
        assert!(session.calls.lock().is_empty());
    }
}
