//! Text notations: frames, filter expressions and controller selectors
//!
//! Frame notation:
//! - `123#AABBCC` standard data frame, `12345678#...` extended
//! - `123#R` / `123#R4` remote frame (requested length defaults to 8)
//! - `123##1AABB` FD frame, the nibble after `##` carries BRS (bit 0) and
//!   ESI (bit 1)
//! - `.` may separate payload bytes; a classic frame with exactly 8 bytes
//!   may end in `_<code>`
//!
//! Filter expression: comma-separated `id:mask` and `low-high` tokens.
//!
//! Controller selector: `twai<N>` optionally followed by `,<filters>`.

use std::fmt::Write;

use crate::constants::{
    MAX_CONTROLLERS, MAX_FILTER_INPUT_LEN, MAX_MASK_FILTERS, MAX_RANGE_FILTERS,
    TWAIFD_FRAME_MAX_LEN, TWAI_EXT_ID_CHAR_LEN, TWAI_EXT_ID_MASK, TWAI_FD_BRS_FLAG_MASK,
    TWAI_FD_ESI_FLAG_MASK, TWAI_FD_FLAGS_MAX_VALUE, TWAI_FRAME_BUFFER_SIZE, TWAI_FRAME_MAX_LEN,
    TWAI_MAX_DLC, TWAI_RTR_DEFAULT_DLC, TWAI_STD_ID_CHAR_LEN,
};
use crate::error::ParseError;
use crate::frame::{len_to_dlc, validate_id, FrameHeader, TwaiFrame};
use crate::structures::{FilterCapacity, FilterSet, MaskFilter, RangeFilter, TimestampMode};

type ParseResult<T> = std::result::Result<T, ParseError>;

fn hex_nibble(text: &str, pos: usize, offset: usize) -> ParseResult<u8> {
    let byte = text.as_bytes()[pos];
    match (byte as char).to_digit(16) {
        Some(v) if byte.is_ascii() => Ok(v as u8),
        _ => Err(ParseError::InvalidHexDigit {
            ch: text[pos..].chars().next().unwrap_or('?'),
            pos: offset + pos,
        }),
    }
}

/// Parse 1..=8 hex digits as an unsigned value
fn parse_hex_u32(text: &str, offset: usize) -> ParseResult<u32> {
    let mut value: u32 = 0;
    for pos in 0..text.len() {
        value = (value << 4) | hex_nibble(text, pos, offset)? as u32;
    }
    Ok(value)
}

/// Decoded payload bytes and where parsing stopped
struct Payload {
    bytes: [u8; TWAI_FRAME_BUFFER_SIZE],
    len: usize,
    end: usize,
}

/// Parse hex byte pairs with optional `.` separators
///
/// Stops at the end of input, or at `_` when `stop_at_suffix` is set.
fn parse_payload(
    text: &str,
    offset: usize,
    max: usize,
    mode: &'static str,
    stop_at_suffix: bool,
) -> ParseResult<Payload> {
    let raw = text.as_bytes();
    let mut payload = Payload {
        bytes: [0u8; TWAI_FRAME_BUFFER_SIZE],
        len: 0,
        end: raw.len(),
    };

    let mut pos = 0;
    while pos < raw.len() {
        match raw[pos] {
            b'.' => {
                pos += 1;
                continue;
            }
            b'_' if stop_at_suffix => {
                payload.end = pos;
                break;
            }
            _ => {}
        }

        let hi = hex_nibble(text, pos, offset)?;
        if pos + 1 >= raw.len() || matches!(raw[pos + 1], b'.' | b'_') {
            return Err(ParseError::IncompleteByte(offset + pos));
        }
        let lo = hex_nibble(text, pos + 1, offset)?;
        if payload.len == max {
            return Err(ParseError::PayloadTooLong { max, mode });
        }
        payload.bytes[payload.len] = (hi << 4) | lo;
        payload.len += 1;
        pos += 2;
    }

    Ok(payload)
}

/// Decode a frame from its text notation
///
/// # Arguments
/// * `text` - Frame in `<id>#<data>`, `<id>#R[n]` or `<id>##<flags><data>` form
///
/// # Returns
/// The decoded frame, or the first syntax error found
pub fn decode_frame(text: &str) -> ParseResult<TwaiFrame> {
    let sep = text.find('#').ok_or(ParseError::MissingSeparator)?;
    let id_text = &text[..sep];
    let extended = match id_text.len() {
        TWAI_STD_ID_CHAR_LEN => false,
        TWAI_EXT_ID_CHAR_LEN => true,
        other => return Err(ParseError::InvalidIdLength(other)),
    };
    let id = parse_hex_u32(id_text, 0)?;
    validate_id(id, extended)?;

    let mut header = FrameHeader {
        id,
        extended,
        ..FrameHeader::default()
    };
    let body_start = sep + 1;
    let body = &text[body_start..];

    if let Some(fd_body) = body.strip_prefix('#') {
        let flags_pos = body_start + 1;
        let flags = fd_body
            .chars()
            .next()
            .and_then(|c| c.to_digit(16))
            .map(|v| v as u8)
            .filter(|&v| v <= TWAI_FD_FLAGS_MAX_VALUE)
            .ok_or(ParseError::InvalidFdFlags)?;
        let payload = parse_payload(
            &fd_body[1..],
            flags_pos + 1,
            TWAIFD_FRAME_MAX_LEN,
            "TWAI-FD",
            false,
        )?;
        header.fd = true;
        header.brs = flags & TWAI_FD_BRS_FLAG_MASK != 0;
        header.esi = flags & TWAI_FD_ESI_FLAG_MASK != 0;
        header.dlc = len_to_dlc(payload.len, true);
        return Ok(TwaiFrame::from_parts(header, &payload.bytes[..payload.len]));
    }

    if let Some(rest) = body.strip_prefix(|c: char| c.eq_ignore_ascii_case(&'r')) {
        header.rtr = true;
        header.dlc = match rest.as_bytes() {
            [] => TWAI_RTR_DEFAULT_DLC,
            [digit, tail @ ..] => {
                let dlc = (*digit as char)
                    .to_digit(16)
                    .map(|v| v as u8)
                    .filter(|&v| v <= TWAI_MAX_DLC)
                    .ok_or(ParseError::InvalidRtrLength)?;
                if !tail.is_empty() {
                    return Err(ParseError::TrailingInput(body_start + 2));
                }
                dlc
            }
        };
        return Ok(TwaiFrame::from_parts(header, &[]));
    }

    let payload = parse_payload(body, body_start, TWAI_FRAME_MAX_LEN, "Classic", true)?;
    if payload.end < body.len() {
        // `_<code>`: one hex digit after a full 8-byte payload, DLC stays 8
        let suffix = &body[payload.end + 1..];
        let valid_code = suffix.len() == 1 && suffix.as_bytes()[0].is_ascii_hexdigit();
        if payload.len != TWAI_FRAME_MAX_LEN || !valid_code {
            return Err(ParseError::InvalidDlcSuffix);
        }
    }
    header.dlc = payload.len as u8;
    Ok(TwaiFrame::from_parts(header, &payload.bytes[..payload.len]))
}

/// Write the normalized text notation of a frame
///
/// Uppercase hex, no separators, RTR always with its length.
pub(crate) fn write_frame(out: &mut impl Write, frame: &TwaiFrame) -> std::fmt::Result {
    if frame.is_extended() {
        write!(out, "{:08X}#", frame.id())?;
    } else {
        write!(out, "{:03X}#", frame.id())?;
    }

    if frame.is_remote() {
        return write!(out, "R{}", frame.dlc());
    }
    if frame.is_fd() {
        let mut flags = 0;
        if frame.is_brs() {
            flags |= TWAI_FD_BRS_FLAG_MASK;
        }
        if frame.is_esi() {
            flags |= TWAI_FD_ESI_FLAG_MASK;
        }
        write!(out, "#{:X}", flags)?;
    }
    for byte in frame.data() {
        write!(out, "{:02X}", byte)?;
    }
    Ok(())
}

/// Encode a frame into its normalized text notation
pub fn encode_frame(frame: &TwaiFrame) -> String {
    let mut text = String::with_capacity(16 + frame.data_len() * 2);
    // Writing into a String cannot fail
    let _ = write_frame(&mut text, frame);
    text
}

/// Parse one filter value
///
/// # Returns
/// The value, and whether it was written with the extended identifier width
fn parse_filter_value(text: &str, token: &str) -> ParseResult<(u32, bool)> {
    if text.is_empty() || text.len() > TWAI_EXT_ID_CHAR_LEN {
        return Err(ParseError::InvalidFilterToken(token.to_string()));
    }
    let value = parse_hex_u32(text, 0)
        .map_err(|_| ParseError::InvalidFilterToken(token.to_string()))?;
    if value > TWAI_EXT_ID_MASK {
        return Err(ParseError::IdOutOfRange {
            id: value,
            extended: true,
        });
    }
    Ok((value, text.len() > TWAI_STD_ID_CHAR_LEN))
}

/// Parse a filter expression against the controller's filter banks
///
/// An empty expression yields an empty set (accept all). The whole
/// expression is validated before anything is returned, so a failing
/// expression never leaves a partial set behind.
///
/// As with frame identifiers, the hex width selects the frame format: a
/// mask filter is extended when its id has more than three digits, a range
/// filter when either bound does.
pub fn parse_filters(expr: &str, capacity: FilterCapacity) -> ParseResult<FilterSet> {
    if expr.len() >= MAX_FILTER_INPUT_LEN {
        return Err(ParseError::FilterTooLong(MAX_FILTER_INPUT_LEN));
    }

    let mask_limit = capacity.mask_filters.min(MAX_MASK_FILTERS);
    let range_limit = capacity.range_filters.min(MAX_RANGE_FILTERS);
    let mut set = FilterSet::default();

    for token in expr.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some((id, mask)) = token.split_once(':') {
            let (id, extended) = parse_filter_value(id, token)?;
            let (mask, _) = parse_filter_value(mask, token)?;
            let filter = if extended {
                MaskFilter::new_extended(id, mask)
            } else {
                MaskFilter::new(id, mask)
            };
            if set.masks.len() >= mask_limit {
                return Err(ParseError::TooManyMaskFilters(mask_limit));
            }
            set.masks
                .push(filter)
                .map_err(|_| ParseError::TooManyMaskFilters(mask_limit))?;
        } else if let Some((low, high)) = token.split_once('-') {
            if range_limit == 0 {
                return Err(ParseError::RangeFilterUnsupported(token.to_string()));
            }
            let (low, low_wide) = parse_filter_value(low, token)?;
            let (high, high_wide) = parse_filter_value(high, token)?;
            let extended = low_wide || high_wide;
            if low > high {
                return Err(ParseError::InvertedRange { low, high });
            }
            if set.ranges.len() >= range_limit {
                return Err(ParseError::TooManyRangeFilters(range_limit));
            }
            let filter = if extended {
                RangeFilter::new_extended(low, high)
            } else {
                RangeFilter::new(low, high)
            };
            set.ranges
                .push(filter)
                .map_err(|_| ParseError::TooManyRangeFilters(range_limit))?;
        } else {
            return Err(ParseError::InvalidFilterToken(token.to_string()));
        }
    }

    Ok(set)
}

/// Parse `twai<N>[,<filters>]`
///
/// # Arguments
/// * `text` - Selector text
/// * `controller_count` - Number of controllers available
///
/// # Returns
/// The controller id and the (possibly empty) filter expression
pub fn parse_controller_selector(
    text: &str,
    controller_count: usize,
) -> ParseResult<(usize, &str)> {
    let invalid = || ParseError::InvalidController(text.to_string());
    let (name, filters) = match text.split_once(',') {
        Some((name, filters)) => (name, filters),
        None => (text, ""),
    };

    let digits = name.strip_prefix("twai").ok_or_else(invalid)?;
    let id = match digits.as_bytes() {
        [d] if d.is_ascii_digit() => (d - b'0') as usize,
        _ => return Err(invalid()),
    };
    if id >= controller_count.min(MAX_CONTROLLERS) {
        return Err(invalid());
    }
    Ok((id, filters))
}

/// Parse a timestamp selector: `a`, `d`, `z` or `n`
pub fn parse_timestamp_mode(text: &str) -> ParseResult<TimestampMode> {
    match text {
        "a" => Ok(TimestampMode::Absolute),
        "d" => Ok(TimestampMode::Delta),
        "z" => Ok(TimestampMode::ZeroRelative),
        "n" => Ok(TimestampMode::None),
        other => Err(ParseError::InvalidTimestampMode(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FD_CAPACITY: FilterCapacity = FilterCapacity {
        mask_filters: 3,
        range_filters: 1,
    };

    #[test]
    fn test_decode_standard_frame() {
        let frame = decode_frame("123#AABBCC").unwrap();
        assert_eq!(frame.id(), 0x123);
        assert!(!frame.is_extended());
        assert!(!frame.is_remote());
        assert_eq!(frame.dlc(), 3);
        assert_eq!(frame.data(), &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_decode_remote_default_length() {
        let frame = decode_frame("12345678#R").unwrap();
        assert_eq!(frame.id(), 0x12345678);
        assert!(frame.is_extended());
        assert!(frame.is_remote());
        assert_eq!(frame.dlc(), 8);

        let frame = decode_frame("123#r3").unwrap();
        assert_eq!(frame.dlc(), 3);
        assert_eq!(decode_frame("123#R9"), Err(ParseError::InvalidRtrLength));
        assert_eq!(decode_frame("123#R12"), Err(ParseError::TrailingInput(6)));
    }

    #[test]
    fn test_decode_normalizes_on_encode() {
        let frame = decode_frame("1ab#de.ad.be.ef").unwrap();
        assert_eq!(encode_frame(&frame), "1AB#DEADBEEF");
        assert_eq!(encode_frame(&decode_frame("123#").unwrap()), "123#");
        assert_eq!(encode_frame(&decode_frame("0000ABCD#R").unwrap()), "0000ABCD#R8");
        assert_eq!(frame.to_string(), "1AB#DEADBEEF");
    }

    #[test]
    fn test_id_length_selects_format() {
        assert_eq!(decode_frame("12#00"), Err(ParseError::InvalidIdLength(2)));
        assert_eq!(decode_frame("1234#00"), Err(ParseError::InvalidIdLength(4)));
        assert_eq!(
            decode_frame("800#00"),
            Err(ParseError::IdOutOfRange {
                id: 0x800,
                extended: false
            })
        );
        let frame = decode_frame("00000800#00").unwrap();
        assert!(frame.is_extended());
        assert_eq!(frame.id(), 0x800);
        assert!(decode_frame("20000000#00").is_err());
    }

    #[test]
    fn test_decode_syntax_errors() {
        assert_eq!(decode_frame("123"), Err(ParseError::MissingSeparator));
        assert_eq!(
            decode_frame("12G#00"),
            Err(ParseError::InvalidHexDigit { ch: 'G', pos: 2 })
        );
        assert_eq!(
            decode_frame("123#AZ"),
            Err(ParseError::InvalidHexDigit { ch: 'Z', pos: 5 })
        );
        assert_eq!(decode_frame("123#ABC"), Err(ParseError::IncompleteByte(6)));
        assert_eq!(decode_frame("123#A.B"), Err(ParseError::IncompleteByte(4)));
        assert_eq!(
            decode_frame("123#112233445566778899"),
            Err(ParseError::PayloadTooLong {
                max: 8,
                mode: "Classic"
            })
        );
    }

    #[test]
    fn test_dlc_suffix_requires_full_payload() {
        let frame = decode_frame("123#1122334455667788_F").unwrap();
        assert_eq!(frame.dlc(), 8);
        assert_eq!(frame.data_len(), 8);
        assert_eq!(decode_frame("123#1122_9"), Err(ParseError::InvalidDlcSuffix));
        assert_eq!(
            decode_frame("123#1122334455667788_"),
            Err(ParseError::InvalidDlcSuffix)
        );
        assert_eq!(
            decode_frame("123#1122334455667788_AB"),
            Err(ParseError::InvalidDlcSuffix)
        );
    }

    #[test]
    fn test_decode_fd_frame() {
        let frame = decode_frame("123##1AABBCCDDEEFF001122").unwrap();
        assert!(frame.is_fd());
        assert!(frame.is_brs());
        assert!(!frame.is_esi());
        assert_eq!(frame.data_len(), 9);
        assert_eq!(frame.dlc(), 9);
        assert_eq!(encode_frame(&frame), "123##1AABBCCDDEEFF001122");

        let frame = decode_frame("123##2").unwrap();
        assert!(frame.is_esi());
        assert_eq!(frame.data_len(), 0);

        assert_eq!(decode_frame("123##4AA"), Err(ParseError::InvalidFdFlags));
        assert_eq!(decode_frame("123##"), Err(ParseError::InvalidFdFlags));
        let too_long = format!("123##0{}", "AA".repeat(65));
        assert_eq!(
            decode_frame(&too_long),
            Err(ParseError::PayloadTooLong {
                max: 64,
                mode: "TWAI-FD"
            })
        );
    }

    #[test]
    fn test_filter_mask_and_range() {
        let set = parse_filters("123:7FF,a-15", FD_CAPACITY).unwrap();
        assert_eq!(set.masks.len(), 1);
        assert_eq!(set.masks[0].id, 0x123);
        assert_eq!(set.masks[0].mask, 0x7FF);
        assert!(!set.masks[0].extended);
        assert_eq!(set.ranges.len(), 1);
        assert_eq!(set.ranges[0].low, 0xA);
        assert_eq!(set.ranges[0].high, 0x15);
    }

    #[test]
    fn test_filter_inverted_range() {
        let err = parse_filters("200-100", FD_CAPACITY).unwrap_err();
        assert_eq!(
            err,
            ParseError::InvertedRange {
                low: 0x200,
                high: 0x100
            }
        );
    }

    #[test]
    fn test_filter_empty_accepts_all() {
        assert!(parse_filters("", FD_CAPACITY).unwrap().is_accept_all());
        assert!(parse_filters(",,", FD_CAPACITY).unwrap().is_accept_all());
    }

    #[test]
    fn test_filter_capacity_is_an_error() {
        let err = parse_filters("1:7FF,2:7FF,3:7FF,4:7FF", FD_CAPACITY).unwrap_err();
        assert_eq!(err, ParseError::TooManyMaskFilters(3));
        assert!(err.is_capacity_error());

        let err = parse_filters("1-2,3-4", FD_CAPACITY).unwrap_err();
        assert_eq!(err, ParseError::TooManyRangeFilters(1));

        let classic = FilterCapacity {
            mask_filters: 1,
            range_filters: 0,
        };
        assert!(matches!(
            parse_filters("1-2", classic),
            Err(ParseError::RangeFilterUnsupported(_))
        ));
    }

    #[test]
    fn test_filter_bad_tokens() {
        assert!(matches!(
            parse_filters("123", FD_CAPACITY),
            Err(ParseError::InvalidFilterToken(_))
        ));
        assert!(matches!(
            parse_filters("12x:7FF", FD_CAPACITY),
            Err(ParseError::InvalidFilterToken(_))
        ));
        assert!(matches!(
            parse_filters(":7FF", FD_CAPACITY),
            Err(ParseError::InvalidFilterToken(_))
        ));
        let long = "1:7FF,".repeat(50);
        assert_eq!(
            parse_filters(&long, FD_CAPACITY),
            Err(ParseError::FilterTooLong(256))
        );
    }

    #[test]
    fn test_extended_filter_inferred_from_width() {
        let set = parse_filters("12345678:1FFFFFFF", FD_CAPACITY).unwrap();
        assert!(set.masks[0].extended);

        // Three digits stay standard even above 0x7FF in the mask
        let set = parse_filters("123:FFF", FD_CAPACITY).unwrap();
        assert!(!set.masks[0].extended);

        let set = parse_filters("100-10000000", FD_CAPACITY).unwrap();
        assert!(set.ranges[0].extended);
        let set = parse_filters("00000100-00000200", FD_CAPACITY).unwrap();
        assert!(set.ranges[0].extended);
        assert_eq!(set.ranges[0].high, 0x200);
    }

    #[test]
    fn test_range_crossing_standard_limit() {
        let set = parse_filters("700-900", FD_CAPACITY).unwrap();
        let range = set.ranges[0];
        assert!(!range.extended);
        assert!(range.matches(0x700, false));
        assert!(range.matches(0x750, false));
        assert!(range.matches(0x7FF, false));
        assert!(!range.matches(0x750, true));
    }

    #[test]
    fn test_controller_selector() {
        assert_eq!(parse_controller_selector("twai0", 2), Ok((0, "")));
        assert_eq!(
            parse_controller_selector("twai1,123:7FF", 2),
            Ok((1, "123:7FF"))
        );
        assert!(parse_controller_selector("twai2", 2).is_err());
        assert!(parse_controller_selector("twai10", 10).is_err());
        assert!(parse_controller_selector("can0", 2).is_err());
        assert!(parse_controller_selector("twai", 2).is_err());
    }

    #[test]
    fn test_timestamp_selector() {
        assert_eq!(parse_timestamp_mode("a"), Ok(TimestampMode::Absolute));
        assert_eq!(parse_timestamp_mode("z"), Ok(TimestampMode::ZeroRelative));
        assert!(parse_timestamp_mode("x").is_err());
    }
}
