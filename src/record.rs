//! TLS record-header framer.
//!
//! Encodes and decodes the 5-byte record header: one byte of content
//! type, two bytes of big-endian legacy protocol version, two bytes of
//! big-endian content length. The session layer uses it only to find
//! where TLS data ends within an incoming ciphertext buffer: the first
//! byte that fails to begin a valid record marks the boundary between
//! record data and trailing leftovers.

use byteorder::{BigEndian, ByteOrder};

use crate::Error;

pub const HEADER_SIZE: usize = 5;

/// Largest legal record content length.
pub const MAX_CONTENT_LENGTH: usize = 16384;

const VERSION_MIN: u16 = 0x0301;
const VERSION_MAX: u16 = 0x0304;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Invalid,
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Option<ContentType> {
        match value {
            0 => Some(ContentType::Invalid),
            20 => Some(ContentType::ChangeCipherSpec),
            21 => Some(ContentType::Alert),
            22 => Some(ContentType::Handshake),
            23 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ContentType::Invalid => 0,
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    /// Legacy protocol version, `0x0301..=0x0304`.
    pub version: u16,
    pub length: u16,
}

impl RecordHeader {
    /// Decode a header from the front of `buffer` without consuming
    /// input. A short buffer reports `WouldBlock`; an out-of-range
    /// field reports `Invalid`.
    pub fn decode(buffer: &[u8]) -> Result<RecordHeader, Error> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::WouldBlock);
        }
        let content_type = match ContentType::from_u8(buffer[0]) {
            Some(content_type) if content_type != ContentType::Invalid => content_type,
            _ => return Err(Error::Invalid),
        };
        let version = BigEndian::read_u16(&buffer[1..3]);
        if version < VERSION_MIN || version > VERSION_MAX {
            return Err(Error::Invalid);
        }
        let length = BigEndian::read_u16(&buffer[3..5]);
        if length as usize > MAX_CONTENT_LENGTH {
            return Err(Error::Invalid);
        }
        Ok(RecordHeader {
            content_type,
            version,
            length,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0; HEADER_SIZE];
        header[0] = self.content_type.to_u8();
        BigEndian::write_u16(&mut header[1..3], self.version);
        BigEndian::write_u16(&mut header[3..5], self.length);
        header
    }
}

/// Walk `buffer` record by record and return the offset of the first
/// byte that does not begin a valid record. Everything before the
/// offset is record data (including a trailing partial record, which
/// may still complete); everything from the offset onward is leftovers.
pub fn scan_boundary(buffer: &[u8]) -> usize {
    let mut offset = 0;
    while offset < buffer.len() {
        match RecordHeader::decode(&buffer[offset..]) {
            Ok(header) => {
                offset += HEADER_SIZE + header.length as usize;
            }
            // A partial header may still grow into a valid record.
            Err(Error::WouldBlock) => return buffer.len(),
            Err(_) => return offset,
        }
    }
    buffer.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let header = RecordHeader {
            content_type: ContentType::ApplicationData,
            version: 0x0303,
            length: 1234,
        };
        let encoded = header.encode();
        assert_eq!(RecordHeader::decode(&encoded), Ok(header));
    }

    #[test]
    fn partial_header_would_block() {
        let header = RecordHeader {
            content_type: ContentType::Handshake,
            version: 0x0301,
            length: 5,
        };
        let encoded = header.encode();
        for len in 0..HEADER_SIZE {
            assert_eq!(RecordHeader::decode(&encoded[..len]), Err(Error::WouldBlock));
        }
    }

    #[test]
    fn out_of_range_fields_are_invalid() {
        // Unknown content type.
        assert_eq!(
            RecordHeader::decode(&[99, 0x03, 0x03, 0, 1]),
            Err(Error::Invalid)
        );
        // Explicit invalid content type.
        assert_eq!(
            RecordHeader::decode(&[0, 0x03, 0x03, 0, 1]),
            Err(Error::Invalid)
        );
        // Version outside the legacy range.
        assert_eq!(
            RecordHeader::decode(&[23, 0x02, 0xff, 0, 1]),
            Err(Error::Invalid)
        );
        assert_eq!(
            RecordHeader::decode(&[23, 0x03, 0x05, 0, 1]),
            Err(Error::Invalid)
        );
        // Length above 2^14.
        assert_eq!(
            RecordHeader::decode(&[23, 0x03, 0x03, 0x40, 0x01]),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn boundary_scan_splits_records_from_leftovers() {
        let mut wire = Vec::new();
        wire.extend_from_slice(
            &RecordHeader {
                content_type: ContentType::ApplicationData,
                version: 0x0303,
                length: 4,
            }
            .encode(),
        );
        wire.extend_from_slice(b"data");
        wire.extend_from_slice(
            &RecordHeader {
                content_type: ContentType::Alert,
                version: 0x0303,
                length: 2,
            }
            .encode(),
        );
        wire.extend_from_slice(&[1, 0]);
        let records_end = wire.len();
        wire.extend_from_slice(b"post");

        assert_eq!(scan_boundary(&wire), records_end);
        assert_eq!(scan_boundary(&wire[..records_end]), records_end);
    }

    #[test]
    fn boundary_scan_keeps_partial_records() {
        let mut wire = Vec::new();
        wire.extend_from_slice(
            &RecordHeader {
                content_type: ContentType::Handshake,
                version: 0x0303,
                length: 100,
            }
            .encode(),
        );
        wire.extend_from_slice(&[0; 10]);
        assert_eq!(scan_boundary(&wire), wire.len());

        // A bare partial header is also still record data.
        assert_eq!(scan_boundary(&[22, 0x03]), 2);
    }
}
