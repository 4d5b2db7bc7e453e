//! TWAI frame implementation
//!
//! `TwaiFrame` is a plain value type: header flags plus an inline payload
//! buffer sized for the largest FD frame, so frames can be copied through
//! queues without allocation.

use crate::constants::{
    TWAIFD_DLC_TO_LEN, TWAIFD_FRAME_MAX_LEN, TWAIFD_MAX_DLC, TWAI_EXT_ID_MASK,
    TWAI_FRAME_BUFFER_SIZE, TWAI_FRAME_MAX_LEN, TWAI_MAX_DLC, TWAI_STD_ID_MASK,
};
use crate::error::{ParseError, Result};

/// Convert DLC to data length
pub fn dlc_to_len(dlc: u8, fd: bool) -> usize {
    if fd {
        if (dlc as usize) < TWAIFD_DLC_TO_LEN.len() {
            TWAIFD_DLC_TO_LEN[dlc as usize]
        } else {
            TWAIFD_FRAME_MAX_LEN
        }
    } else {
        (dlc as usize).min(TWAI_FRAME_MAX_LEN)
    }
}

/// Convert data length to DLC
pub fn len_to_dlc(length: usize, fd: bool) -> u8 {
    if fd {
        for (dlc, &dlen) in TWAIFD_DLC_TO_LEN.iter().enumerate() {
            if dlen >= length {
                return dlc as u8;
            }
        }
        TWAIFD_MAX_DLC
    } else {
        length.min(TWAI_FRAME_MAX_LEN) as u8
    }
}

/// Check an identifier against the 11-bit or 29-bit range
pub fn validate_id(id: u32, extended: bool) -> std::result::Result<(), ParseError> {
    let max = if extended {
        TWAI_EXT_ID_MASK
    } else {
        TWAI_STD_ID_MASK
    };
    if id > max {
        return Err(ParseError::IdOutOfRange { id, extended });
    }
    Ok(())
}

/// Frame header: identifier, format flags and data length code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    /// 11-bit or 29-bit identifier
    pub id: u32,
    /// Extended (29-bit) identifier
    pub extended: bool,
    /// Remote transmission request
    pub rtr: bool,
    /// FD frame format
    pub fd: bool,
    /// Bit rate switch (FD only)
    pub brs: bool,
    /// Error state indicator (FD only)
    pub esi: bool,
    /// Data length code
    pub dlc: u8,
}

/// TWAI frame
///
/// Supports classic frames (8 bytes max), FD frames (64 bytes max) and
/// remote frames (requested length only).
#[derive(Clone, Copy)]
pub struct TwaiFrame {
    /// Frame header
    pub header: FrameHeader,
    data: [u8; TWAI_FRAME_BUFFER_SIZE],
    len: u8,
}

impl Default for TwaiFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl TwaiFrame {
    /// Create an empty standard data frame with id 0
    pub const fn new() -> Self {
        Self {
            header: FrameHeader {
                id: 0,
                extended: false,
                rtr: false,
                fd: false,
                brs: false,
                esi: false,
                dlc: 0,
            },
            data: [0u8; TWAI_FRAME_BUFFER_SIZE],
            len: 0,
        }
    }

    /// Create a classic data frame
    ///
    /// # Arguments
    /// * `id` - 11-bit or 29-bit identifier
    /// * `extended` - Use the 29-bit identifier format
    /// * `data` - Payload, up to 8 bytes
    pub fn with_data(id: u32, extended: bool, data: &[u8]) -> Result<Self> {
        validate_id(id, extended)?;
        if data.len() > TWAI_FRAME_MAX_LEN {
            return Err(ParseError::PayloadTooLong {
                max: TWAI_FRAME_MAX_LEN,
                mode: "Classic",
            }
            .into());
        }
        let mut frame = Self::new();
        frame.header.id = id;
        frame.header.extended = extended;
        frame.set_payload(data);
        frame.header.dlc = data.len() as u8;
        Ok(frame)
    }

    /// Create a remote frame requesting `dlc` bytes
    pub fn remote(id: u32, extended: bool, dlc: u8) -> Result<Self> {
        validate_id(id, extended)?;
        if dlc > TWAI_MAX_DLC {
            return Err(ParseError::InvalidRtrLength.into());
        }
        let mut frame = Self::new();
        frame.header.id = id;
        frame.header.extended = extended;
        frame.header.rtr = true;
        frame.header.dlc = dlc;
        Ok(frame)
    }

    /// Create an FD frame
    ///
    /// # Arguments
    /// * `id` - 11-bit or 29-bit identifier
    /// * `extended` - Use the 29-bit identifier format
    /// * `data` - Payload, up to 64 bytes
    /// * `brs` - Transmit the data phase at the data bitrate
    pub fn with_fd_data(id: u32, extended: bool, data: &[u8], brs: bool) -> Result<Self> {
        validate_id(id, extended)?;
        if data.len() > TWAIFD_FRAME_MAX_LEN {
            return Err(ParseError::PayloadTooLong {
                max: TWAIFD_FRAME_MAX_LEN,
                mode: "TWAI-FD",
            }
            .into());
        }
        let mut frame = Self::new();
        frame.header.id = id;
        frame.header.extended = extended;
        frame.header.fd = true;
        frame.header.brs = brs;
        frame.set_payload(data);
        frame.header.dlc = len_to_dlc(data.len(), true);
        Ok(frame)
    }

    /// Assemble a frame from a header and a payload delivered by a transceiver
    ///
    /// The payload is truncated to the inline buffer.
    pub fn from_parts(header: FrameHeader, payload: &[u8]) -> Self {
        let mut frame = Self::new();
        frame.header = header;
        if !header.rtr {
            frame.set_payload(payload);
        }
        frame
    }

    fn set_payload(&mut self, data: &[u8]) {
        let data_len = data.len().min(TWAI_FRAME_BUFFER_SIZE);
        self.data = [0u8; TWAI_FRAME_BUFFER_SIZE];
        self.data[..data_len].copy_from_slice(&data[..data_len]);
        self.len = data_len as u8;
    }

    /// Get the identifier
    pub fn id(&self) -> u32 {
        self.header.id
    }

    /// Check if this is an extended ID frame (29-bit)
    pub fn is_extended(&self) -> bool {
        self.header.extended
    }

    /// Check if this is a remote transmission request
    pub fn is_remote(&self) -> bool {
        self.header.rtr
    }

    /// Check if this is an FD frame
    pub fn is_fd(&self) -> bool {
        self.header.fd
    }

    /// Check if bit rate switch is enabled
    pub fn is_brs(&self) -> bool {
        self.header.brs
    }

    /// Check if the error state indicator is set
    pub fn is_esi(&self) -> bool {
        self.header.esi
    }

    /// Get the data length code
    pub fn dlc(&self) -> u8 {
        self.header.dlc
    }

    /// Number of payload bytes actually carried
    pub fn data_len(&self) -> usize {
        self.len as usize
    }

    /// Payload bytes actually carried
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_len()]
    }

    /// Length implied by the DLC
    ///
    /// For FD frames whose payload is not a valid FD length this is larger
    /// than `data_len()`; the extra bytes read as zero padding.
    pub fn dlc_length(&self) -> usize {
        dlc_to_len(self.header.dlc, self.header.fd)
    }

    /// Payload padded with zeros up to the DLC length
    pub fn padded_data(&self) -> &[u8] {
        &self.data[..self.dlc_length().max(self.data_len())]
    }
}

impl PartialEq for TwaiFrame {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.data() == other.data()
    }
}

impl Eq for TwaiFrame {}

impl std::fmt::Display for TwaiFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::codec::write_frame(f, self)
    }
}

impl std::fmt::Debug for TwaiFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwaiFrame")
            .field("id", &format_args!("0x{:X}", self.header.id))
            .field("extended", &self.header.extended)
            .field("rtr", &self.header.rtr)
            .field("fd", &self.header.fd)
            .field("brs", &self.header.brs)
            .field("esi", &self.header.esi)
            .field("dlc", &self.header.dlc)
            .field("data", &self.data())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlc_to_len_classic() {
        assert_eq!(dlc_to_len(0, false), 0);
        assert_eq!(dlc_to_len(8, false), 8);
        assert_eq!(dlc_to_len(15, false), 8);
    }

    #[test]
    fn test_dlc_to_len_fd() {
        assert_eq!(dlc_to_len(8, true), 8);
        assert_eq!(dlc_to_len(9, true), 12);
        assert_eq!(dlc_to_len(15, true), 64);
    }

    #[test]
    fn test_len_to_dlc_fd_rounds_up() {
        assert_eq!(len_to_dlc(8, true), 8);
        assert_eq!(len_to_dlc(9, true), 9);
        assert_eq!(len_to_dlc(12, true), 9);
        assert_eq!(len_to_dlc(33, true), 14);
        assert_eq!(len_to_dlc(64, true), 15);
        assert_eq!(len_to_dlc(64, false), 8);
    }

    #[test]
    fn test_standard_id_range() {
        assert!(TwaiFrame::with_data(0x7FF, false, &[]).is_ok());
        let err = TwaiFrame::with_data(0x800, false, &[]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
        assert!(TwaiFrame::with_data(0x800, true, &[]).is_ok());
        assert!(TwaiFrame::with_data(0x2000_0000, true, &[]).is_err());
    }

    #[test]
    fn test_classic_payload_limit() {
        assert!(TwaiFrame::with_data(0x123, false, &[0u8; 9]).is_err());
        let frame = TwaiFrame::with_data(0x123, false, &[1, 2, 3]).unwrap();
        assert_eq!(frame.dlc(), 3);
        assert_eq!(frame.data(), &[1, 2, 3]);
    }

    #[test]
    fn test_fd_frame_padding() {
        let data: Vec<u8> = (0..10).collect();
        let frame = TwaiFrame::with_fd_data(0x123, false, &data, true).unwrap();
        assert_eq!(frame.dlc(), 9);
        assert_eq!(frame.data_len(), 10);
        assert_eq!(frame.dlc_length(), 12);
        assert_eq!(&frame.padded_data()[10..], &[0, 0]);
    }

    #[test]
    fn test_remote_frame_has_no_payload() {
        let frame = TwaiFrame::remote(0x12345678, true, 4).unwrap();
        assert!(frame.is_remote());
        assert_eq!(frame.dlc(), 4);
        assert!(frame.data().is_empty());
        assert!(TwaiFrame::remote(0x1, false, 9).is_err());
    }
}
