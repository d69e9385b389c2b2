//! RTP packet encoding and decoding according to RFC 3550
//!
//! Besides the parsed [`RtpHeader`]/[`RtpPacket`] pair this module offers a
//! handful of raw-buffer helpers for the bridging fast path, which rewrites
//! SSRC and payload-type fields in place without a full reparse.

use bitvec::prelude::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::Error;
use crate::{Result, RtpCsrc, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version (always 2 in practice)
pub const RTP_VERSION: u8 = 2;

/// Minimum header size (without CSRC or extensions)
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// RTP header implementation according to RFC 3550
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (should be 2)
    pub version: u8,

    /// Padding flag
    pub padding: bool,

    /// Extension flag
    pub extension: bool,

    /// CSRC count (number of contributing sources)
    pub cc: u8,

    /// Marker bit
    pub marker: bool,

    /// Payload type
    pub payload_type: u8,

    /// Sequence number
    pub sequence_number: RtpSequenceNumber,

    /// Timestamp
    pub timestamp: RtpTimestamp,

    /// Synchronization source identifier
    pub ssrc: RtpSsrc,

    /// Contributing source identifiers
    pub csrc: Vec<RtpCsrc>,

    /// Extension header ID
    pub extension_id: Option<u16>,

    /// Extension data
    pub extension_data: Option<Bytes>,
}

impl Default for RtpHeader {
    fn default() -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            cc: 0,
            marker: false,
            payload_type: 0,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            csrc: Vec::new(),
            extension_id: None,
            extension_data: None,
        }
    }
}

impl RtpHeader {
    /// Create a new RTP header with default flags
    pub fn new(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            ..Default::default()
        }
    }

    /// Size of the serialized header in bytes
    pub fn size(&self) -> usize {
        let mut size = RTP_MIN_HEADER_SIZE + self.csrc.len() * 4;
        if self.extension {
            size += 4;
            if let Some(data) = &self.extension_data {
                size += (data.len() + 3) / 4 * 4;
            }
        }
        size
    }

    /// Parse an RTP header from the front of `buf`
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RTP_MIN_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_MIN_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        // First byte: version (2), padding (1), extension (1), CSRC count (4)
        let first = buf.get_u8();
        let bits = first.view_bits::<Msb0>();
        let version = bits[0..2].load::<u8>();
        if version != RTP_VERSION {
            return Err(Error::InvalidPacket(format!(
                "unsupported RTP version {}",
                version
            )));
        }
        let padding = bits[2];
        let extension = bits[3];
        let cc = bits[4..8].load::<u8>();

        // Second byte: marker (1), payload type (7)
        let second = buf.get_u8();
        let marker = second & 0x80 != 0;
        let payload_type = second & 0x7f;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let mut csrc = Vec::with_capacity(cc as usize);
        for _ in 0..cc {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            csrc.push(buf.get_u32());
        }

        let (extension_id, extension_data) = if extension {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            let id = buf.get_u16();
            let words = buf.get_u16() as usize;
            let len = words * 4;
            if buf.remaining() < len {
                return Err(Error::BufferTooSmall {
                    required: len,
                    available: buf.remaining(),
                });
            }
            let data = buf.copy_to_bytes(len);
            (Some(id), Some(data))
        } else {
            (None, None)
        };

        Ok(Self {
            version,
            padding,
            extension,
            cc,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_id,
            extension_data,
        })
    }

    /// Serialize the header into `buf`
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.size());

        let mut first = (self.version & 0x03) << 6;
        if self.padding {
            first |= 1 << 5;
        }
        if self.extension {
            first |= 1 << 4;
        }
        first |= self.cc & 0x0f;
        buf.put_u8(first);

        let mut second = self.payload_type & 0x7f;
        if self.marker {
            second |= 0x80;
        }
        buf.put_u8(second);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        if self.cc as usize != self.csrc.len() {
            return Err(Error::InvalidParameter(format!(
                "CSRC count {} does not match list length {}",
                self.cc,
                self.csrc.len()
            )));
        }
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if self.extension {
            let data = self.extension_data.as_ref().ok_or_else(|| {
                Error::InvalidParameter("extension flag set without extension data".to_string())
            })?;
            buf.put_u16(self.extension_id.unwrap_or(0));
            let words = (data.len() + 3) / 4;
            buf.put_u16(words as u16);
            buf.put_slice(data);
            for _ in 0..(words * 4 - data.len()) {
                buf.put_u8(0);
            }
        }

        Ok(())
    }
}

/// A parsed RTP packet
#[derive(Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// RTP header
    pub header: RtpHeader,

    /// Payload data
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Total size of the serialized packet in bytes
    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len()
    }

    /// Parse an RTP packet, stripping any padding
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        let header = RtpHeader::parse(&mut buf)?;

        let padding = if header.padding && !buf.is_empty() {
            let pad = *buf.last().unwrap_or(&0) as usize;
            if pad > buf.len() {
                return Err(Error::InvalidPacket(format!(
                    "padding {} exceeds remaining {} bytes",
                    pad,
                    buf.len()
                )));
            }
            pad
        } else {
            0
        };

        let payload = buf.slice(0..buf.len() - padding);
        Ok(Self { header, payload })
    }

    /// Serialize the packet
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        self.header.serialize(&mut buf)?;
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

impl fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpPacket")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// True when the buffer starts with an RTP version-2 header.
pub fn is_rtp_version_2(buf: &[u8]) -> bool {
    buf.len() >= RTP_MIN_HEADER_SIZE && buf[0] >> 6 == RTP_VERSION
}

/// Read the SSRC field without parsing the whole packet.
pub fn peek_ssrc(buf: &[u8]) -> Option<RtpSsrc> {
    if buf.len() < RTP_MIN_HEADER_SIZE {
        return None;
    }
    Some(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]))
}

/// Rewrite the SSRC field in place.
pub fn rewrite_ssrc(buf: &mut [u8], ssrc: RtpSsrc) -> Result<()> {
    if buf.len() < RTP_MIN_HEADER_SIZE {
        return Err(Error::BufferTooSmall {
            required: RTP_MIN_HEADER_SIZE,
            available: buf.len(),
        });
    }
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
    Ok(())
}

/// Rewrite the payload type in place, preserving the marker bit.
pub fn rewrite_payload_type(buf: &mut [u8], payload_type: u8) -> Result<()> {
    if buf.len() < RTP_MIN_HEADER_SIZE {
        return Err(Error::BufferTooSmall {
            required: RTP_MIN_HEADER_SIZE,
            available: buf.len(),
        });
    }
    buf[1] = (buf[1] & 0x80) | (payload_type & 0x7f);
    Ok(())
}
