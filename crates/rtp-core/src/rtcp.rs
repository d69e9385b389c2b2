//! Minimal RTCP support
//!
//! The fabric interprets RTCP only to learn the SSRC a peer uses on its
//! stream towards us, so a mixer can cancel the echo of its own outbound
//! stream. Sender reports and SDES chunks carry that SSRC; everything else
//! in a compound packet is skipped over.

use crate::RtpSsrc;

/// RTCP packet types interpreted by the fabric
pub const RTCP_SENDER_REPORT: u8 = 200;
pub const RTCP_RECEIVER_REPORT: u8 = 201;
pub const RTCP_SOURCE_DESCRIPTION: u8 = 202;
pub const RTCP_BYE: u8 = 203;
pub const RTCP_APP: u8 = 204;

/// True when the second byte of an RTP-class datagram marks it as RTCP.
pub fn is_rtcp_packet_type(packet_type: u8) -> bool {
    (RTCP_SENDER_REPORT..=RTCP_APP).contains(&packet_type)
}

/// Walk a compound RTCP packet and return the originating SSRC of the
/// first SR or SDES packet found.
pub fn learned_source(buf: &[u8]) -> Option<RtpSsrc> {
    let mut rest = buf;

    while rest.len() >= 8 {
        if rest[0] >> 6 != 2 {
            return None;
        }
        let packet_type = rest[1];
        let length_words = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        let packet_len = (length_words + 1) * 4;
        if packet_len > rest.len() {
            return None;
        }

        match packet_type {
            RTCP_SENDER_REPORT | RTCP_SOURCE_DESCRIPTION => {
                // SR: SSRC of sender; SDES: SSRC of the first chunk.
                // Both sit directly after the common header.
                return Some(u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]));
            }
            _ => {
                rest = &rest[packet_len..];
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sdes_packet(ssrc: u32) -> Vec<u8> {
        // SDES with one chunk: ssrc + CNAME item "a" + terminator, padded
        let mut buf = vec![0x81, RTCP_SOURCE_DESCRIPTION, 0x00, 0x03];
        buf.extend_from_slice(&ssrc.to_be_bytes());
        buf.extend_from_slice(&[1, 1, b'a', 0]); // CNAME, len 1, "a", end
        buf.extend_from_slice(&[0, 0, 0, 0]); // chunk padding
        buf
    }

    fn receiver_report(ssrc: u32) -> Vec<u8> {
        let mut buf = vec![0x80, RTCP_RECEIVER_REPORT, 0x00, 0x01];
        buf.extend_from_slice(&ssrc.to_be_bytes());
        buf
    }

    #[test]
    fn test_learns_ssrc_from_sdes() {
        let buf = sdes_packet(0x1234_5678);
        assert_eq!(learned_source(&buf), Some(0x1234_5678));
    }

    #[test]
    fn test_skips_rr_to_find_sdes() {
        let mut buf = receiver_report(0x0101_0101);
        buf.extend_from_slice(&sdes_packet(0xaabb_ccdd));
        assert_eq!(learned_source(&buf), Some(0xaabb_ccdd));
    }

    #[test]
    fn test_rr_only_compound_learns_nothing() {
        let buf = receiver_report(0x0101_0101);
        assert_eq!(learned_source(&buf), None);
    }

    #[test]
    fn test_truncated_packet_learns_nothing() {
        let buf = sdes_packet(0x1234_5678);
        assert_eq!(learned_source(&buf[..6]), None);
    }

    #[test]
    fn test_packet_type_classification() {
        assert!(is_rtcp_packet_type(200));
        assert!(is_rtcp_packet_type(204));
        assert!(!is_rtcp_packet_type(199));
        assert!(!is_rtcp_packet_type(205));
        assert!(!is_rtcp_packet_type(96));
    }
}
