//! Wire protocol: packetizes a [`FrameOut`] into the ordered byte sequences
//! the transport ships, one packet per message. The Core treats the result as
//! opaque; only the embedded display firmware needs to actually parse it.

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{CodecTag, FrameOut};

const PACKET_KIND_RECT: u8 = 1;
const PACKET_KIND_STATS: u8 = 2;

pub trait ProtocolEncoder: Send + Sync {
    fn build_frame_packets(
        &self,
        frame: &FrameOut,
        frame_id: u32,
        max_bytes: usize,
    ) -> Vec<Bytes>;

    fn build_frame_stats_packet(&self, frame_id: u32, rect_count: usize) -> Bytes;
}

/// Compact length-prefixed encoding: each packet is
/// `[kind:u8][frame_id:u32][is_full_frame:u8][x:u16][y:u16][w:u16][h:u16][payload_len:u32][payload]`
/// for rect packets, chunked so no packet exceeds `max_bytes`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthPrefixedEncoder;

impl ProtocolEncoder for LengthPrefixedEncoder {
    fn build_frame_packets(&self, frame: &FrameOut, frame_id: u32, max_bytes: usize) -> Vec<Bytes> {
        let mut packets = Vec::with_capacity(frame.rects.len());
        for rect in &frame.rects {
            let header_len = 1 + 4 + 1 + 2 + 2 + 2 + 2 + 4;
            let budget = max_bytes.saturating_sub(header_len).max(1);
            for chunk in rect.payload.chunks(budget) {
                let mut buf = BytesMut::with_capacity(header_len + chunk.len());
                buf.put_u8(PACKET_KIND_RECT);
                buf.put_u32(frame_id);
                buf.put_u8(frame.is_full_frame as u8);
                buf.put_u16(rect.x.min(u16::MAX as u32) as u16);
                buf.put_u16(rect.y.min(u16::MAX as u32) as u16);
                buf.put_u16(rect.w.min(u16::MAX as u32) as u16);
                buf.put_u16(rect.h.min(u16::MAX as u32) as u16);
                buf.put_u32(chunk.len() as u32);
                buf.put_slice(chunk);
                packets.push(buf.freeze());
            }
        }
        packets
    }

    fn build_frame_stats_packet(&self, frame_id: u32, rect_count: usize) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 4 + 4);
        buf.put_u8(PACKET_KIND_STATS);
        buf.put_u32(frame_id);
        buf.put_u32(rect_count as u32);
        buf.freeze()
    }
}
