//! TWAI utility constants
//!
//! Identifier masks, payload limits, text-notation widths, configuration
//! defaults, and the GS-USB wire constants used by the USB back-end.

// ============================================================================
// Identifier Masks
// ============================================================================

/// Standard frame identifier mask (11-bit ID)
pub const TWAI_STD_ID_MASK: u32 = 0x0000_07FF;
/// Extended frame identifier mask (29-bit ID)
pub const TWAI_EXT_ID_MASK: u32 = 0x1FFF_FFFF;

/// Hex digits of a standard identifier in frame notation
pub const TWAI_STD_ID_CHAR_LEN: usize = 3;
/// Hex digits of an extended identifier in frame notation
pub const TWAI_EXT_ID_CHAR_LEN: usize = 8;

// ============================================================================
// Payload Definitions
// ============================================================================

/// Maximum payload of a classic frame
pub const TWAI_FRAME_MAX_LEN: usize = 8;
/// Maximum payload of an FD frame
pub const TWAIFD_FRAME_MAX_LEN: usize = 64;
/// Inline buffer size, sized for the largest frame variant
pub const TWAI_FRAME_BUFFER_SIZE: usize = TWAIFD_FRAME_MAX_LEN;

/// Maximum DLC of a classic frame
pub const TWAI_MAX_DLC: u8 = 8;
/// Maximum DLC of an FD frame
pub const TWAIFD_MAX_DLC: u8 = 15;

/// DLC to data length conversion table for FD frames
pub const TWAIFD_DLC_TO_LEN: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Requested length of an RTR frame written without one (`123#R`)
pub const TWAI_RTR_DEFAULT_DLC: u8 = 8;

/// Largest valid FD flag nibble (`BRS | ESI`)
pub const TWAI_FD_FLAGS_MAX_VALUE: u8 = 3;
/// FD flag nibble bit: bit rate switch
pub const TWAI_FD_BRS_FLAG_MASK: u8 = 0x01;
/// FD flag nibble bit: error state indicator
pub const TWAI_FD_ESI_FLAG_MASK: u8 = 0x02;

/// Longest accepted filter expression
pub const MAX_FILTER_INPUT_LEN: usize = 256;

// ============================================================================
// Controller Limits
// ============================================================================

/// Controllers addressable by the `twai<N>` selector (single decimal digit)
pub const MAX_CONTROLLERS: usize = 10;
/// Controllers provided by the virtual bus unless configured otherwise
pub const DEFAULT_CONTROLLER_COUNT: usize = 2;

/// Upper bound of mask filter banks on any supported controller
pub const MAX_MASK_FILTERS: usize = 4;
/// Upper bound of range filter banks on any supported controller
pub const MAX_RANGE_FILTERS: usize = 2;

/// Mask filter banks of the virtual controller
pub const VIRTUAL_MASK_FILTER_NUM: usize = 3;
/// Range filter banks of the virtual controller
pub const VIRTUAL_RANGE_FILTER_NUM: usize = 1;

// ============================================================================
// Configuration Defaults
// ============================================================================

/// Arbitration bitrate applied at startup and by reset
pub const DEFAULT_BITRATE: u32 = 500_000;
/// FD data-phase bitrate used when FD is enabled without an explicit rate
pub const DEFAULT_FD_DATA_BITRATE: u32 = 1_000_000;
/// Secondary sample point of the FD data phase (per mille)
pub const DEFAULT_FD_DATA_SSP_PERMILL: u16 = 700;

/// TX pin assigned to controller 0 at startup
pub const DEFAULT_TX_GPIO: i32 = 4;
/// RX pin assigned to controller 0 at startup
pub const DEFAULT_RX_GPIO: i32 = 5;

/// Driver transmit queue depth
pub const DEFAULT_TX_QUEUE_DEPTH: u32 = 10;

/// Capture ring capacity
pub const DEFAULT_CAPTURE_QUEUE_DEPTH: usize = 32;
/// Capture consumer poll interval in milliseconds
pub const DEFAULT_CAPTURE_POLL_MS: u64 = 100;
/// Capture consumer stack size in bytes
pub const DEFAULT_CAPTURE_STACK_SIZE: usize = 64 * 1024;

/// Completion wait of a console `send`
pub const DEFAULT_TX_TIMEOUT_MS: u64 = 1000;

// ============================================================================
// GS-USB Wire Constants
// ============================================================================

/// Listen-only mode (no ACKs sent)
pub const GS_CAN_MODE_LISTEN_ONLY: u32 = 1 << 0;
/// Loopback mode
pub const GS_CAN_MODE_LOOP_BACK: u32 = 1 << 1;
/// One-shot mode (no retransmission)
pub const GS_CAN_MODE_ONE_SHOT: u32 = 1 << 3;
/// CAN FD mode
pub const GS_CAN_MODE_FD: u32 = 1 << 8;

/// Device supports CAN FD
pub const GS_CAN_FEATURE_FD: u32 = 1 << 8;
/// Device supports GET_STATE request
pub const GS_CAN_FEATURE_GET_STATE: u32 = 1 << 13;

/// Extended frame format flag in the wire identifier
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Remote transmission request flag in the wire identifier
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
/// Error message frame flag in the wire identifier
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;

/// CAN FD frame
pub const GS_CAN_FLAG_FD: u8 = 1 << 1;
/// Bit rate switch
pub const GS_CAN_FLAG_BRS: u8 = 1 << 2;
/// Error state indicator
pub const GS_CAN_FLAG_ESI: u8 = 1 << 3;

/// Bus state values of the GET_STATE response
pub const GS_CAN_STATE_ERROR_ACTIVE: u32 = 0;
pub const GS_CAN_STATE_ERROR_WARNING: u32 = 1;
pub const GS_CAN_STATE_ERROR_PASSIVE: u32 = 2;
pub const GS_CAN_STATE_BUS_OFF: u32 = 3;
pub const GS_CAN_STATE_STOPPED: u32 = 4;

/// Echo ID value of frames received from the bus
pub const GS_USB_RX_ECHO_ID: u32 = 0xFFFF_FFFF;

/// Wire header: echo_id, can_id, dlc, channel, flags, reserved
pub const GS_USB_HEADER_SIZE: usize = 12;
/// Classic frame size on the wire (without timestamp)
pub const GS_USB_FRAME_SIZE: usize = GS_USB_HEADER_SIZE + TWAI_FRAME_MAX_LEN;
/// FD frame size on the wire (without timestamp)
pub const GS_USB_FRAME_SIZE_FD: usize = GS_USB_HEADER_SIZE + TWAIFD_FRAME_MAX_LEN;

/// GS-USB default vendor/product ID
pub const GS_USB_ID: (u16, u16) = (0x1D50, 0x606F);
/// candleLight vendor/product ID
pub const GS_USB_CANDLELIGHT_ID: (u16, u16) = (0x1209, 0x2323);
/// CES CANext FD vendor/product ID
pub const GS_USB_CES_CANEXT_FD_ID: (u16, u16) = (0x1CD2, 0x606F);
/// ABE CANdebugger FD vendor/product ID
pub const GS_USB_ABE_CANDEBUGGER_FD_ID: (u16, u16) = (0x16D0, 0x10B8);

/// Set bit timing
pub const GS_USB_BREQ_BITTIMING: u8 = 1;
/// Set/start mode
pub const GS_USB_BREQ_MODE: u8 = 2;
/// Get bit timing constants
pub const GS_USB_BREQ_BT_CONST: u8 = 4;
/// Get device configuration
pub const GS_USB_BREQ_DEVICE_CONFIG: u8 = 5;
/// Set data phase bit timing (CAN FD)
pub const GS_USB_BREQ_DATA_BITTIMING: u8 = 10;
/// Get CAN state
pub const GS_USB_BREQ_GET_STATE: u8 = 14;

/// Reset/stop mode
pub const GS_CAN_MODE_RESET: u32 = 0;
/// Start mode
pub const GS_CAN_MODE_START: u32 = 1;

/// Bulk OUT endpoint (host to device)
pub const GS_USB_ENDPOINT_OUT: u8 = 0x02;
/// Bulk IN endpoint (device to host)
pub const GS_USB_ENDPOINT_IN: u8 = 0x81;
