//! JPIP message headers and the end-of-response trailer.

use std::convert::TryFrom;

use num_enum::TryFromPrimitive;

use crate::databin::DatabinClass;
use crate::error::JpipError;
use crate::protocol::vbas;

/// One message header, as carried before each queued data chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub class: DatabinClass,
    pub codestream_index: u64,
    pub in_class_id: u64,
    /// Offset of the body within the databin.
    pub body_offset: usize,
    pub body_length: usize,
    /// Set when the body's last byte is the databin's last byte.
    pub is_last_in_databin: bool,
    /// Auxiliary field carried by extended (odd) databin classes.
    pub aux: Option<u64>,
}

/// End-of-response reason codes (ISO/IEC 15444-9 D.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum EorCode {
    ImageDone = 0,
    WindowDone = 1,
    WindowChange = 2,
    ByteLimitReached = 3,
    QualityLimitReached = 4,
    SessionLimitReached = 5,
    ResponseLimitReached = 6,
    NonSpecified = 0xFF,
}

impl EorCode {
    /// `true` when the server declared the requested window fully served.
    pub fn declares_complete(self) -> bool {
        matches!(self, Self::ImageDone | Self::WindowDone)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfResponse {
    pub code: EorCode,
    pub reason: Vec<u8>,
}

/// One item pulled from a response's message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedItem {
    Header { header: MessageHeader, next_pos: usize },
    EndOfResponse { eor: EndOfResponse, next_pos: usize },
}

/// Bin-ID indicator values (top two bits after the continuation bit).
const IND_NO_CLASS: u8 = 1;
const IND_CLASS: u8 = 2;
const IND_CLASS_AND_CSN: u8 = 3;

/// Stateful header parser for one response.
///
/// Class id and codestream index are inherited from the previous header
/// in the same response; at the start of a response they default to the
/// precinct class and codestream 0.
pub struct MessageHeaderParser {
    prev_class_id: u64,
    prev_csn: u64,
}

impl MessageHeaderParser {
    pub fn new() -> Self {
        Self {
            prev_class_id: DatabinClass::Precinct as u64,
            prev_csn: 0,
        }
    }

    /// Parses the next header or end-of-response trailer at `pos`.
    ///
    /// `Ok(None)` means the bytes run out mid-field; the caller should
    /// await more transport data and retry from the same `pos`. Parser
    /// state only advances on a fully parsed item.
    pub fn parse(&mut self, bytes: &[u8], pos: usize) -> Result<Option<ParsedItem>, JpipError> {
        let Some(&first) = bytes.get(pos) else {
            return Ok(None);
        };

        // A zero byte in header position is the end-of-response marker:
        // code byte, reason-length VBAS, reason bytes.
        if first == 0 {
            let Some(&code_byte) = bytes.get(pos + 1) else {
                return Ok(None);
            };
            let code =
                EorCode::try_from(code_byte).map_err(|_| JpipError::UnknownEorCode(code_byte))?;
            let Some((reason_len, after_len)) = vbas::decode(bytes, pos + 2)? else {
                return Ok(None);
            };
            let reason_len = reason_len as usize;
            if bytes.len() < after_len + reason_len {
                return Ok(None);
            }
            let reason = bytes[after_len..after_len + reason_len].to_vec();
            return Ok(Some(ParsedItem::EndOfResponse {
                eor: EndOfResponse { code, reason },
                next_pos: after_len + reason_len,
            }));
        }

        let indicator = (first >> 5) & 0x3;
        if indicator == 0 {
            return Err(JpipError::InvalidBinIdIndicator);
        }
        let is_last = first & 0x10 != 0;
        let seed = u64::from(first & 0x0F);
        let Some((in_class_id, mut cursor)) =
            vbas::decode_continuation(bytes, pos + 1, seed, first & 0x80 != 0)?
        else {
            return Ok(None);
        };

        let class_id = if indicator >= IND_CLASS {
            let Some((value, next)) = vbas::decode(bytes, cursor)? else {
                return Ok(None);
            };
            cursor = next;
            value
        } else {
            debug_assert_eq!(indicator, IND_NO_CLASS);
            self.prev_class_id
        };

        let csn = if indicator == IND_CLASS_AND_CSN {
            let Some((value, next)) = vbas::decode(bytes, cursor)? else {
                return Ok(None);
            };
            cursor = next;
            value
        } else {
            self.prev_csn
        };

        let Some((body_offset, next)) = vbas::decode(bytes, cursor)? else {
            return Ok(None);
        };
        cursor = next;
        let Some((body_length, next)) = vbas::decode(bytes, cursor)? else {
            return Ok(None);
        };
        cursor = next;

        let class = DatabinClass::from_class_id(class_id)?;
        let aux = if class.has_aux_field() {
            let Some((value, next)) = vbas::decode(bytes, cursor)? else {
                return Ok(None);
            };
            cursor = next;
            Some(value)
        } else {
            None
        };

        self.prev_class_id = class_id;
        self.prev_csn = csn;

        Ok(Some(ParsedItem::Header {
            header: MessageHeader {
                class,
                codestream_index: csn,
                in_class_id,
                body_offset: body_offset as usize,
                body_length: body_length as usize,
                is_last_in_databin: is_last,
                aux,
            },
            next_pos: cursor,
        }))
    }
}

impl Default for MessageHeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a header byte sequence: explicit class (indicator 2),
    /// 4-bit in-class id, offset and length as single-byte VBAS.
    fn simple_header(class: u8, in_class: u8, last: bool, offset: u8, length: u8) -> Vec<u8> {
        let mut first = (IND_CLASS << 5) | (in_class & 0x0F);
        if last {
            first |= 0x10;
        }
        vec![first, class, offset, length]
    }

    #[test]
    fn parses_explicit_class() {
        let bytes = simple_header(6, 0, true, 0, 42);
        let mut parser = MessageHeaderParser::new();
        let ParsedItem::Header { header, next_pos } = parser.parse(&bytes, 0).unwrap().unwrap()
        else {
            panic!("expected header");
        };
        assert_eq!(header.class, DatabinClass::MainHeader);
        assert_eq!(header.in_class_id, 0);
        assert_eq!(header.body_offset, 0);
        assert_eq!(header.body_length, 42);
        assert!(header.is_last_in_databin);
        assert_eq!(header.aux, None);
        assert_eq!(next_pos, 4);
    }

    #[test]
    fn inherits_class_and_csn_from_previous_header() {
        let mut bytes = simple_header(2, 1, false, 0, 5);
        // Second header: indicator 1, no class/csn fields.
        bytes.extend_from_slice(&[(IND_NO_CLASS << 5) | 0x02, 10, 7]);
        let mut parser = MessageHeaderParser::new();
        let ParsedItem::Header { next_pos, .. } = parser.parse(&bytes, 0).unwrap().unwrap() else {
            panic!("expected header");
        };
        let ParsedItem::Header { header, .. } = parser.parse(&bytes, next_pos).unwrap().unwrap()
        else {
            panic!("expected header");
        };
        assert_eq!(header.class, DatabinClass::TileHeader);
        assert_eq!(header.in_class_id, 2);
        assert_eq!(header.body_offset, 10);
        assert_eq!(header.body_length, 7);
    }

    #[test]
    fn multibyte_in_class_id_continues_from_first_byte() {
        // in-class id = (0b1010 << 7) | 0x2C, continuation on first byte.
        let first = 0x80 | (IND_CLASS << 5) | 0b1010;
        let bytes = vec![first, 0x2C, 0, 3, 9];
        let mut parser = MessageHeaderParser::new();
        let ParsedItem::Header { header, .. } = parser.parse(&bytes, 0).unwrap().unwrap() else {
            panic!("expected header");
        };
        assert_eq!(header.in_class_id, (0b1010 << 7) | 0x2C);
        assert_eq!(header.class, DatabinClass::Precinct);
    }

    #[test]
    fn odd_class_carries_aux_field() {
        let mut bytes = simple_header(1, 3, false, 0, 4);
        bytes.push(9); // aux
        let mut parser = MessageHeaderParser::new();
        let ParsedItem::Header { header, next_pos } = parser.parse(&bytes, 0).unwrap().unwrap()
        else {
            panic!("expected header");
        };
        assert_eq!(header.class, DatabinClass::ExtendedPrecinct);
        assert_eq!(header.aux, Some(9));
        assert_eq!(next_pos, 5);
    }

    #[test]
    fn indicator_zero_is_fatal() {
        // Nonzero byte with indicator bits 00 (e.g. only the last-byte flag).
        let mut parser = MessageHeaderParser::new();
        let err = parser.parse(&[0x10, 0, 0], 0).unwrap_err();
        assert_eq!(err, JpipError::InvalidBinIdIndicator);
    }

    #[test]
    fn truncated_header_awaits_more_data() {
        let bytes = simple_header(6, 0, false, 0, 42);
        let mut parser = MessageHeaderParser::new();
        for cut in 0..bytes.len() {
            assert_eq!(parser.parse(&bytes[..cut], 0).unwrap(), None, "cut {cut}");
        }
    }

    #[test]
    fn truncated_header_leaves_inheritance_intact() {
        let mut parser = MessageHeaderParser::new();
        let full = simple_header(2, 1, false, 0, 5);
        // A partial parse of a class-bearing header must not leak its class.
        assert!(parser.parse(&full[..2], 0).unwrap().is_none());
        let inherit_only = [(IND_NO_CLASS << 5) | 0x01, 0, 1];
        let ParsedItem::Header { header, .. } =
            parser.parse(&inherit_only, 0).unwrap().unwrap()
        else {
            panic!("expected header");
        };
        assert_eq!(header.class, DatabinClass::Precinct);
    }

    #[test]
    fn end_of_response_trailer() {
        let bytes = vec![0x00, 0x01, 0x02, b'o', b'k'];
        let mut parser = MessageHeaderParser::new();
        let ParsedItem::EndOfResponse { eor, next_pos } =
            parser.parse(&bytes, 0).unwrap().unwrap()
        else {
            panic!("expected EOR");
        };
        assert_eq!(eor.code, EorCode::WindowDone);
        assert!(eor.code.declares_complete());
        assert_eq!(eor.reason, b"ok");
        assert_eq!(next_pos, 5);
    }

    #[test]
    fn truncated_end_of_response_awaits_more_data() {
        let mut parser = MessageHeaderParser::new();
        assert_eq!(parser.parse(&[0x00], 0).unwrap(), None);
        assert_eq!(parser.parse(&[0x00, 0x03, 0x05, 0xAA], 0).unwrap(), None);
    }

    #[test]
    fn unknown_eor_code_is_fatal() {
        let mut parser = MessageHeaderParser::new();
        let err = parser.parse(&[0x00, 0x77, 0x00], 0).unwrap_err();
        assert_eq!(err, JpipError::UnknownEorCode(0x77));
    }
}
