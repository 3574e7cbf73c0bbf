//! H.264 over RTP (RFC 6184) with RTSP interleaved framing

use crate::transport::TransportError;
use bytes::{BufMut, Bytes, BytesMut};
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Payloader;
use webrtc::rtp::sequence::{Sequencer, new_random_sequencer};
use webrtc::util::Marshal;

const RTP_VERSION: u8 = 2;

/// Turns access units into marshalled RTP packets for one SSRC.
///
/// NAL splitting, single NAL and FU-A payloads as well as the STAP-A
/// aggregation of SPS/PPS come from the H.264 payloader.
pub struct RtpPacketizer {
    payload_type: u8,
    ssrc: u32,
    max_payload: usize,
    payloader: H264Payloader,
    sequencer: Box<dyn Sequencer + Send + Sync>,
}

impl RtpPacketizer {
    /// Random SSRC and initial sequence number.
    pub fn random(payload_type: u8, max_payload: usize) -> Self {
        Self::with_sequencer(
            payload_type,
            rand::random(),
            max_payload,
            Box::new(new_random_sequencer()),
        )
    }

    fn with_sequencer(
        payload_type: u8,
        ssrc: u32,
        max_payload: usize,
        sequencer: Box<dyn Sequencer + Send + Sync>,
    ) -> Self {
        Self {
            payload_type,
            ssrc,
            max_payload,
            payloader: H264Payloader::default(),
            sequencer,
        }
    }

    /// Packetizes one Annex B access unit. All packets share `timestamp` and
    /// the last one carries the marker bit.
    pub fn packetize(
        &mut self,
        access_unit: &Bytes,
        timestamp: u32,
    ) -> Result<Vec<Bytes>, TransportError> {
        let payloads = self.payloader.payload(self.max_payload, access_unit)?;
        let last = payloads.len().saturating_sub(1);

        payloads
            .into_iter()
            .enumerate()
            .map(|(n, payload)| {
                let packet = Packet {
                    header: Header {
                        version: RTP_VERSION,
                        marker: n == last,
                        payload_type: self.payload_type,
                        sequence_number: self.sequencer.next_sequence_number(),
                        timestamp,
                        ssrc: self.ssrc,
                        ..Default::default()
                    },
                    payload,
                };
                Ok(packet.marshal()?)
            })
            .collect()
    }
}

/// Frames `packet` for an RTSP interleaved channel: `$`, channel, length.
pub fn interleave(channel: u8, packet: &[u8], out: &mut BytesMut) {
    out.reserve(4 + packet.len());
    out.put_u8(b'$');
    out.put_u8(channel);
    out.put_u16(packet.len() as u16);
    out.put_slice(packet);
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp::sequence::new_fixed_sequencer;
    use webrtc::util::Unmarshal;

    const NAL_TYPE_STAP_A: u8 = 24;
    const NAL_TYPE_FU_A: u8 = 28;

    fn packetizer(ssrc: u32, sequence: u16, max_payload: usize) -> RtpPacketizer {
        RtpPacketizer::with_sequencer(96, ssrc, max_payload, Box::new(new_fixed_sequencer(sequence)))
    }

    fn parse(packets: &[Bytes]) -> Vec<Packet> {
        packets
            .iter()
            .map(|raw| Packet::unmarshal(&mut raw.clone()).unwrap())
            .collect()
    }

    #[test]
    fn test_packet_headers() {
        let mut packetizer = packetizer(0x1234_5678, 65534, 1400);
        let au = Bytes::from_static(&[0, 0, 0, 1, 0x41, 1, 2, 0, 0, 0, 1, 0x41, 3, 0, 0, 0, 1, 0x41, 4, 5]);
        let packets = parse(&packetizer.packetize(&au, 3000).unwrap());

        assert_eq!(packets.len(), 3);
        assert_eq!(
            packets.iter().map(|p| p.header.marker).collect::<Vec<_>>(),
            [false, false, true]
        );
        for pair in packets.windows(2) {
            assert_eq!(
                pair[1].header.sequence_number,
                pair[0].header.sequence_number.wrapping_add(1)
            );
        }
        for packet in &packets {
            assert_eq!(packet.header.version, 2);
            assert_eq!(packet.header.payload_type, 96);
            assert_eq!(packet.header.timestamp, 3000);
            assert_eq!(packet.header.ssrc, 0x1234_5678);
        }
        assert_eq!(&packets[2].payload[..], &[0x41, 4, 5]);
    }

    #[test]
    fn test_parameter_sets_aggregated() {
        let mut packetizer = packetizer(1, 0, 1400);
        let au = Bytes::from_static(&[
            0, 0, 0, 1, 0x67, 0x42, 0x00, // SPS
            0, 0, 1, 0x68, 0xCE, // PPS
            0, 0, 0, 1, 0x65, 0x88, 0x84, // IDR
        ]);
        let packets = parse(&packetizer.packetize(&au, 0).unwrap());

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].payload[0] & 0x1F, NAL_TYPE_STAP_A);
        assert!(!packets[0].header.marker);
        assert_eq!(&packets[1].payload[..], &[0x65, 0x88, 0x84]);
        assert!(packets[1].header.marker);
    }

    #[test]
    fn test_fu_a_fragmentation() {
        let mut packetizer = packetizer(1, 0, 10);
        let mut au = vec![0, 0, 0, 1, 0x65];
        au.extend(1..=20u8);
        let raw = packetizer.packetize(&Bytes::from(au), 0).unwrap();
        assert!(raw.iter().all(|p| p.len() <= 12 + 10));

        let packets = parse(&raw);
        assert!(packets.len() > 1);
        for packet in &packets {
            assert_eq!(packet.payload[0], 0x60 | NAL_TYPE_FU_A);
            assert_eq!(packet.payload[1] & 0x1F, 5);
        }
        assert_ne!(packets[0].payload[1] & 0x80, 0);
        assert_ne!(packets.last().unwrap().payload[1] & 0x40, 0);
        assert!(packets.last().unwrap().header.marker);
        assert!(packets[..packets.len() - 1].iter().all(|p| !p.header.marker));

        let rebuilt: Vec<u8> = packets.iter().flat_map(|p| p.payload[2..].to_vec()).collect();
        assert_eq!(rebuilt, (1..=20u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_access_unit() {
        let mut packetizer = RtpPacketizer::random(96, 1400);
        assert!(packetizer.packetize(&Bytes::new(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_interleave_framing() {
        let mut out = BytesMut::new();
        interleave(0, &[0xAA; 300], &mut out);
        assert_eq!(&out[..4], &[b'$', 0, 0x01, 0x2C]);
        assert_eq!(out.len(), 304);
    }
}
