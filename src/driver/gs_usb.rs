//! GS-USB back-end
//!
//! Drives candleLight, CANable and similar adapters over `rusb`. Every
//! adapter channel is one controller. A single reader thread pulls frames
//! from the bulk IN endpoint and dispatches them by channel: echo frames
//! complete the channel's pending transmission, everything else runs the
//! channel's receive path. The protocol has no acceptance filter banks, so
//! filters are applied in software before a frame is reported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use rusb::{DeviceHandle, GlobalContext};

use super::{DriverCapabilities, EventHandler, SoftwareReceiver, TwaiDriver, TwaiSession};
use crate::constants::*;
use crate::error::{DriverError, DriverResult};
use crate::frame::{dlc_to_len, FrameHeader, TwaiFrame};
use crate::structures::{
    BusState, BusStatus, ControllerConfig, FilterCapacity, MaskFilter, RangeFilter,
};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
const READ_POLL: Duration = Duration::from_millis(100);

/// Bit timing request payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UsbBitTiming {
    prop_seg: u32,
    phase_seg1: u32,
    phase_seg2: u32,
    sjw: u32,
    brp: u32,
}

impl UsbBitTiming {
    fn new(prop_seg: u32, phase_seg1: u32, phase_seg2: u32, sjw: u32, brp: u32) -> Self {
        Self {
            prop_seg,
            phase_seg1,
            phase_seg2,
            sjw,
            brp,
        }
    }

    fn pack(&self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        buf[0..4].copy_from_slice(&self.prop_seg.to_le_bytes());
        buf[4..8].copy_from_slice(&self.phase_seg1.to_le_bytes());
        buf[8..12].copy_from_slice(&self.phase_seg2.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sjw.to_le_bytes());
        buf[16..20].copy_from_slice(&self.brp.to_le_bytes());
        buf
    }
}

/// Arbitration phase timing at 87.5% sample point
fn nominal_timing(clock_hz: u32, bitrate: u32) -> Option<UsbBitTiming> {
    let t = |seg1, seg2, brp| Some(UsbBitTiming::new(1, seg1, seg2, 1, brp));
    match clock_hz {
        48_000_000 => match bitrate {
            10_000 => t(12, 2, 300),
            20_000 => t(12, 2, 150),
            50_000 => t(12, 2, 60),
            100_000 => t(12, 2, 30),
            125_000 => t(12, 2, 24),
            250_000 => t(12, 2, 12),
            500_000 => t(12, 2, 6),
            800_000 => t(11, 2, 4),
            1_000_000 => t(12, 2, 3),
            _ => None,
        },
        80_000_000 => match bitrate {
            10_000 => t(12, 2, 500),
            20_000 => t(12, 2, 250),
            50_000 => t(12, 2, 100),
            100_000 => t(12, 2, 50),
            125_000 => t(12, 2, 40),
            250_000 => t(12, 2, 20),
            500_000 => t(12, 2, 10),
            800_000 => t(7, 1, 10),
            1_000_000 => t(12, 2, 5),
            _ => None,
        },
        40_000_000 => match bitrate {
            10_000 => t(12, 2, 250),
            20_000 => t(12, 2, 125),
            50_000 => t(12, 2, 50),
            100_000 => t(12, 2, 25),
            125_000 => t(12, 2, 20),
            250_000 => t(12, 2, 10),
            500_000 => t(12, 2, 5),
            800_000 => t(7, 1, 5),
            1_000_000 => t(5, 1, 5),
            _ => None,
        },
        _ => None,
    }
}

/// FD data phase timing at 75% sample point
fn data_timing(clock_hz: u32, bitrate: u32) -> Option<UsbBitTiming> {
    let t = |seg1, seg2, brp| Some(UsbBitTiming::new(1, seg1, seg2, 1, brp));
    match clock_hz {
        80_000_000 => match bitrate {
            1_000_000 => t(13, 5, 4),
            2_000_000 => t(4, 2, 5),
            4_000_000 => t(1, 1, 5),
            5_000_000 => t(4, 2, 2),
            8_000_000 => t(2, 1, 2),
            _ => None,
        },
        40_000_000 => match bitrate {
            1_000_000 => t(13, 5, 2),
            2_000_000 => t(6, 2, 2),
            4_000_000 => t(2, 1, 2),
            5_000_000 => t(4, 2, 1),
            8_000_000 => t(2, 1, 1),
            10_000_000 => t(1, 1, 1),
            _ => None,
        },
        _ => None,
    }
}

/// Mode request payload for one channel
fn pack_mode(mode: u32, flags: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&mode.to_le_bytes());
    buf[4..8].copy_from_slice(&flags.to_le_bytes());
    buf
}

/// Adapter mode flags for a controller configuration
fn mode_flags(config: &ControllerConfig, features: u32) -> u32 {
    let mut flags = 0;
    if config.flags.listen_only {
        flags |= GS_CAN_MODE_LISTEN_ONLY;
    }
    if config.flags.loopback {
        flags |= GS_CAN_MODE_LOOP_BACK;
    }
    if config.fail_retry_cnt == 0 {
        flags |= GS_CAN_MODE_ONE_SHOT;
    }
    if config.fd_enabled() {
        flags |= GS_CAN_MODE_FD;
    }
    // Only request what the adapter advertises
    flags & features
}

/// Encode a frame for the bulk OUT endpoint
fn pack_frame(frame: &TwaiFrame, channel: u8, fd_mode: bool) -> Vec<u8> {
    let data_len = if fd_mode {
        TWAIFD_FRAME_MAX_LEN
    } else {
        TWAI_FRAME_MAX_LEN
    };
    let mut can_id = frame.id();
    if frame.is_extended() {
        can_id |= CAN_EFF_FLAG;
    }
    if frame.is_remote() {
        can_id |= CAN_RTR_FLAG;
    }
    let mut flags = 0u8;
    if frame.is_fd() {
        flags |= GS_CAN_FLAG_FD;
        if frame.is_brs() {
            flags |= GS_CAN_FLAG_BRS;
        }
        if frame.is_esi() {
            flags |= GS_CAN_FLAG_ESI;
        }
    }

    let mut buf = Vec::with_capacity(GS_USB_HEADER_SIZE + data_len);
    // One frame in flight per channel: the channel number is the echo id
    buf.extend_from_slice(&(channel as u32).to_le_bytes());
    buf.extend_from_slice(&can_id.to_le_bytes());
    buf.push(frame.dlc());
    buf.push(channel);
    buf.push(flags);
    buf.push(0);
    let mut data = [0u8; TWAIFD_FRAME_MAX_LEN];
    let padded = frame.padded_data();
    data[..padded.len()].copy_from_slice(padded);
    buf.extend_from_slice(&data[..data_len]);
    buf
}

/// A frame read from the bulk IN endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InboundFrame {
    echo_id: u32,
    channel: u8,
    error_frame: bool,
    frame: TwaiFrame,
}

/// Decode a bulk IN transfer; None when it is too short for its header
fn unpack_frame(raw: &[u8]) -> Option<InboundFrame> {
    if raw.len() < GS_USB_HEADER_SIZE {
        return None;
    }
    let echo_id = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let can_id = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let dlc = raw[8];
    let channel = raw[9];
    let flags = raw[10];

    let fd = flags & GS_CAN_FLAG_FD != 0;
    let extended = can_id & CAN_EFF_FLAG != 0;
    let header = FrameHeader {
        id: if extended {
            can_id & TWAI_EXT_ID_MASK
        } else {
            can_id & TWAI_STD_ID_MASK
        },
        extended,
        rtr: can_id & CAN_RTR_FLAG != 0,
        fd,
        brs: fd && flags & GS_CAN_FLAG_BRS != 0,
        esi: fd && flags & GS_CAN_FLAG_ESI != 0,
        dlc,
    };
    let payload = &raw[GS_USB_HEADER_SIZE..];
    let len = dlc_to_len(dlc, fd).min(payload.len());

    Some(InboundFrame {
        echo_id,
        channel,
        error_frame: can_id & CAN_ERR_FLAG != 0,
        frame: TwaiFrame::from_parts(header, &payload[..len]),
    })
}

struct UsbDevice {
    handle: DeviceHandle<GlobalContext>,
    clock_hz: u32,
    features: u32,
    channels: Mutex<Vec<Option<Arc<GsUsbChannel>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    reader_running: AtomicBool,
}

impl UsbDevice {
    fn control_out(&self, request: u8, value: u16, data: &[u8]) -> DriverResult<()> {
        self.handle.write_control(
            0x41, // vendor, host-to-device
            request,
            value,
            0,
            data,
            CONTROL_TIMEOUT,
        )?;
        Ok(())
    }

    fn control_in(&self, request: u8, value: u16, length: usize) -> DriverResult<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let len = self.handle.read_control(
            0xC1, // vendor, device-to-host
            request,
            value,
            0,
            &mut buf,
            CONTROL_TIMEOUT,
        )?;
        if len < length {
            return Err(DriverError::InvalidResponse {
                expected: length,
                actual: len,
            });
        }
        Ok(buf)
    }

    fn channel(&self, channel: usize) -> Option<Arc<GsUsbChannel>> {
        self.channels.lock().get(channel).cloned().flatten()
    }

    fn ensure_reader(self: &Arc<Self>) -> DriverResult<()> {
        let mut reader = self.reader.lock();
        if reader.is_some() {
            return Ok(());
        }
        self.reader_running.store(true, Ordering::Release);
        let device = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("gs-usb-reader".to_string())
            .spawn(move || device.run_reader())
            .map_err(|e| {
                self.reader_running.store(false, Ordering::Release);
                DriverError::Rejected {
                    operation: "start reader",
                    reason: e.to_string(),
                }
            })?;
        *reader = Some(handle);
        Ok(())
    }

    fn stop_reader(&self) {
        self.reader_running.store(false, Ordering::Release);
        if let Some(handle) = self.reader.lock().take() {
            if handle.join().is_err() {
                error!("GS-USB reader thread panicked");
            }
        }
    }

    fn run_reader(&self) {
        let mut buf = [0u8; GS_USB_FRAME_SIZE_FD + 4];
        debug!("GS-USB reader started");
        while self.reader_running.load(Ordering::Acquire) {
            let len = match self.handle.read_bulk(GS_USB_ENDPOINT_IN, &mut buf, READ_POLL) {
                Ok(len) => len,
                Err(rusb::Error::Timeout) => continue,
                Err(e) => {
                    error!("GS-USB bulk read failed: {}", e);
                    break;
                }
            };
            let Some(inbound) = unpack_frame(&buf[..len]) else {
                warn!("GS-USB short transfer ({} bytes)", len);
                continue;
            };
            let Some(channel) = self.channel(inbound.channel as usize) else {
                continue;
            };
            if inbound.echo_id != GS_USB_RX_ECHO_ID {
                channel.rx.complete_transmit(true);
            } else if inbound.error_frame {
                trace!("GS-USB channel {} error frame", inbound.channel);
            } else if channel.is_enabled() {
                channel.rx.deliver(&inbound.frame);
            }
        }
        debug!("GS-USB reader stopped");
    }
}

fn is_gs_usb_device(vendor_id: u16, product_id: u16) -> bool {
    [
        GS_USB_ID,
        GS_USB_CANDLELIGHT_ID,
        GS_USB_CES_CANEXT_FD_ID,
        GS_USB_ABE_CANDEBUGGER_FD_ID,
    ]
    .contains(&(vendor_id, product_id))
}

/// USB adapter back-end
pub struct GsUsbDriver {
    device: Arc<UsbDevice>,
    capabilities: DriverCapabilities,
}

impl GsUsbDriver {
    /// Open the first GS-USB adapter found
    pub fn open_first() -> DriverResult<Self> {
        Self::probe(|_, _| true)
    }

    /// Open the adapter at a specific USB bus and address
    pub fn open_at(bus: u8, address: u8) -> DriverResult<Self> {
        Self::probe(|b, a| b == bus && a == address)
    }

    fn probe(mut select: impl FnMut(u8, u8) -> bool) -> DriverResult<Self> {
        for device in rusb::devices()?.iter() {
            if !select(device.bus_number(), device.address()) {
                continue;
            }
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            if !is_gs_usb_device(desc.vendor_id(), desc.product_id()) {
                continue;
            }
            let handle = match device.open() {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(
                        "Cannot open GS-USB device on bus {} addr {}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };
            info!(
                "GS-USB {:04x}:{:04x} on bus {} addr {}",
                desc.vendor_id(),
                desc.product_id(),
                device.bus_number(),
                device.address()
            );
            return Self::from_handle(handle);
        }
        Err(DriverError::DeviceNotFound)
    }

    fn from_handle(mut handle: DeviceHandle<GlobalContext>) -> DriverResult<Self> {
        handle.reset()?;
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(0).unwrap_or(false) {
                handle.detach_kernel_driver(0)?;
            }
        }
        handle.claim_interface(0)?;

        let mut device = UsbDevice {
            handle,
            clock_hz: 0,
            features: 0,
            channels: Mutex::new(Vec::new()),
            reader: Mutex::new(None),
            reader_running: AtomicBool::new(false),
        };

        let config = device.control_in(GS_USB_BREQ_DEVICE_CONFIG, 0, 12)?;
        let channel_count = (config[3] as usize + 1).min(MAX_CONTROLLERS);
        let bt_const = device.control_in(GS_USB_BREQ_BT_CONST, 0, 40)?;
        device.features = u32::from_le_bytes([bt_const[0], bt_const[1], bt_const[2], bt_const[3]]);
        device.clock_hz = u32::from_le_bytes([bt_const[4], bt_const[5], bt_const[6], bt_const[7]]);
        *device.channels.get_mut() = vec![None; channel_count];
        debug!(
            "GS-USB: {} channel(s), clock {} Hz, features 0x{:08x}",
            channel_count, device.clock_hz, device.features
        );

        let capabilities = DriverCapabilities {
            controller_count: channel_count,
            mask_filters: MAX_MASK_FILTERS,
            range_filters: MAX_RANGE_FILTERS,
            supports_fd: device.features & GS_CAN_FEATURE_FD != 0,
        };
        Ok(Self {
            device: Arc::new(device),
            capabilities,
        })
    }
}

impl TwaiDriver for GsUsbDriver {
    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn open_session(
        &self,
        controller: usize,
        config: &ControllerConfig,
    ) -> DriverResult<Arc<dyn TwaiSession>> {
        let device = &self.device;
        let channel = u8::try_from(controller)
            .ok()
            .filter(|_| controller < self.capabilities.controller_count)
            .ok_or_else(|| DriverError::Rejected {
                operation: "open session",
                reason: format!("no channel {}", controller),
            })?;
        if device.channel(controller).is_some() {
            return Err(DriverError::SessionBusy(controller));
        }

        let bitrate = config.bit_timing.bitrate;
        let timing = nominal_timing(device.clock_hz, bitrate).ok_or(
            DriverError::UnsupportedBitrate {
                bitrate,
                clock_hz: device.clock_hz,
            },
        )?;
        device.control_out(GS_USB_BREQ_BITTIMING, channel as u16, &timing.pack())?;

        if config.fd_enabled() {
            if !self.capabilities.supports_fd {
                return Err(DriverError::FdNotSupported);
            }
            let bitrate = config.data_timing.bitrate;
            let timing = data_timing(device.clock_hz, bitrate).ok_or(
                DriverError::UnsupportedDataBitrate {
                    bitrate,
                    clock_hz: device.clock_hz,
                },
            )?;
            device.control_out(GS_USB_BREQ_DATA_BITTIMING, channel as u16, &timing.pack())?;
        }

        let session = Arc::new(GsUsbChannel {
            channel,
            device: Arc::downgrade(device),
            mode_flags: mode_flags(config, device.features),
            listen_only: config.flags.listen_only,
            enabled: AtomicBool::new(false),
            rx: SoftwareReceiver::new(
                FilterCapacity {
                    mask_filters: self.capabilities.mask_filters,
                    range_filters: self.capabilities.range_filters,
                },
                config.flags.no_receive_rtr,
            ),
        });
        let mut channels = device.channels.lock();
        if let Some(slot) = channels.get_mut(controller) {
            *slot = Some(Arc::clone(&session));
        }
        debug!("GS-USB channel {} opened at {} bps", channel, bitrate);
        Ok(session)
    }
}

/// One adapter channel
pub struct GsUsbChannel {
    channel: u8,
    device: Weak<UsbDevice>,
    mode_flags: u32,
    listen_only: bool,
    enabled: AtomicBool,
    rx: SoftwareReceiver,
}

impl GsUsbChannel {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn device(&self) -> DriverResult<Arc<UsbDevice>> {
        self.device.upgrade().ok_or(DriverError::DeviceNotFound)
    }

    fn fd_mode(&self) -> bool {
        self.mode_flags & GS_CAN_MODE_FD != 0
    }
}

impl TwaiSession for GsUsbChannel {
    fn register_callbacks(&self, handler: Arc<dyn EventHandler>) -> DriverResult<()> {
        self.rx.set_handler(handler);
        Ok(())
    }

    fn enable(&self) -> DriverResult<()> {
        let device = self.device()?;
        device.control_out(
            GS_USB_BREQ_MODE,
            self.channel as u16,
            &pack_mode(GS_CAN_MODE_START, self.mode_flags),
        )?;
        self.enabled.store(true, Ordering::Release);
        device.ensure_reader()
    }

    fn disable(&self) -> DriverResult<()> {
        let device = self.device()?;
        self.enabled.store(false, Ordering::Release);
        device.control_out(
            GS_USB_BREQ_MODE,
            self.channel as u16,
            &pack_mode(GS_CAN_MODE_RESET, 0),
        )
    }

    fn transmit(&self, frame: &TwaiFrame, timeout: Duration) -> DriverResult<()> {
        if !self.is_enabled() {
            return Err(DriverError::NotEnabled(self.channel as usize));
        }
        if self.listen_only {
            return Err(DriverError::Rejected {
                operation: "transmit",
                reason: "listen-only mode".to_string(),
            });
        }
        if frame.is_fd() && !self.fd_mode() {
            return Err(DriverError::FdNotSupported);
        }
        let device = self.device()?;
        let data = pack_frame(frame, self.channel, self.fd_mode());
        match device.handle.write_bulk(GS_USB_ENDPOINT_OUT, &data, timeout) {
            Ok(_) => Ok(()),
            Err(rusb::Error::Timeout) => Err(DriverError::TxQueueFull),
            Err(e) => Err(e.into()),
        }
    }

    fn install_mask_filter(&self, index: usize, filter: &MaskFilter) -> DriverResult<()> {
        self.rx.install_mask(index, filter)
    }

    fn install_range_filter(&self, index: usize, filter: &RangeFilter) -> DriverResult<()> {
        self.rx.install_range(index, filter)
    }

    fn bus_status(&self) -> DriverResult<BusStatus> {
        let device = self.device()?;
        if device.features & GS_CAN_FEATURE_GET_STATE == 0 {
            return Err(DriverError::StateNotSupported);
        }
        let data = device.control_in(GS_USB_BREQ_GET_STATE, self.channel as u16, 12)?;
        let word =
            |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let state = match word(0) {
            GS_CAN_STATE_ERROR_ACTIVE => BusState::ErrorActive,
            GS_CAN_STATE_ERROR_WARNING => BusState::ErrorWarning,
            GS_CAN_STATE_ERROR_PASSIVE => BusState::ErrorPassive,
            GS_CAN_STATE_BUS_OFF => BusState::BusOff,
            GS_CAN_STATE_STOPPED => BusState::Stopped,
            _ => BusState::Unknown,
        };
        Ok(BusStatus {
            state,
            rx_error_counter: word(4),
            tx_error_counter: word(8),
        })
    }

    fn close(&self) -> DriverResult<()> {
        self.rx.clear_handler();
        let Some(device) = self.device.upgrade() else {
            return Ok(());
        };
        if self.is_enabled() {
            // The channel is released even if the adapter refuses the reset
            if let Err(e) = self.disable() {
                warn!("GS-USB channel {} reset failed: {}", self.channel, e);
            }
        }
        let idle = {
            let mut channels = device.channels.lock();
            if let Some(slot) = channels.get_mut(self.channel as usize) {
                *slot = None;
            }
            channels.iter().all(Option::is_none)
        };
        if idle {
            device.stop_reader();
        }
        debug!("GS-USB channel {} closed", self.channel);
        Ok(())
    }
}
