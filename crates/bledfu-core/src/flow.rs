//! Flow control for the streaming phase.
//!
//! Decides packet boundaries, where the sequence must stop for a receipt
//! notification, and the minimum gap between packet writes.

use std::thread;
use std::time::{Duration, Instant};

use crate::protocol::constants::{MAX_PACKET_SIZE, PACKETS_PER_ACK, PACKET_INTERVAL};

/// One data packet of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    /// 0-based packet index.
    pub index: usize,
    /// Byte offset into the image.
    pub offset: usize,
    pub bytes: &'a [u8],
    /// A receipt notification must arrive before the next packet.
    pub requires_ack: bool,
    /// Last packet of the image; the end-of-image notification follows it.
    pub is_last: bool,
}

/// Streaming parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowController {
    packets_per_ack: usize,
    packet_interval: Duration,
}

impl Default for FlowController {
    fn default() -> Self {
        Self {
            packets_per_ack: PACKETS_PER_ACK,
            packet_interval: PACKET_INTERVAL,
        }
    }
}

impl FlowController {
    pub fn new(packets_per_ack: usize, packet_interval: Duration) -> Self {
        Self {
            packets_per_ack: packets_per_ack.max(1),
            packet_interval,
        }
    }

    pub fn packet_size(&self) -> usize {
        MAX_PACKET_SIZE
    }

    pub fn packets_per_ack(&self) -> usize {
        self.packets_per_ack
    }

    pub fn packet_interval(&self) -> Duration {
        self.packet_interval
    }

    /// Lazy packet sequence over `image`.
    pub fn packets<'a>(&self, image: &'a [u8]) -> PacketStream<'a> {
        PacketStream::new(image, self.packets_per_ack)
    }

    /// Pacer enforcing the packet interval.
    pub fn pacer(&self) -> Pacer {
        Pacer::new(self.packet_interval)
    }

    /// Packets and acknowledgments an image of `len` bytes will need.
    pub fn plan(&self, len: usize) -> AckPlan {
        let packets = len.div_ceil(MAX_PACKET_SIZE);
        AckPlan {
            packets,
            window_acks: packets / self.packets_per_ack,
            final_acks: 1,
        }
    }
}

/// Expected packet and acknowledgment counts for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPlan {
    pub packets: usize,
    pub window_acks: usize,
    pub final_acks: usize,
}

impl AckPlan {
    pub fn total_acks(&self) -> usize {
        self.window_acks + self.final_acks
    }
}

/// Packet iterator. Consumes the image once, in order.
#[derive(Debug)]
pub struct PacketStream<'a> {
    data: &'a [u8],
    packets_per_ack: usize,
    offset: usize,
    index: usize,
    total: usize,
}

impl<'a> PacketStream<'a> {
    fn new(data: &'a [u8], packets_per_ack: usize) -> Self {
        Self {
            data,
            packets_per_ack: packets_per_ack.max(1),
            offset: 0,
            index: 0,
            total: data.len().div_ceil(MAX_PACKET_SIZE),
        }
    }

    /// Total number of packets.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Packets already yielded.
    pub fn sent(&self) -> usize {
        self.index
    }

    /// Bytes already yielded.
    pub fn bytes_sent(&self) -> usize {
        self.offset
    }

    /// Remaining bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

impl<'a> Iterator for PacketStream<'a> {
    type Item = Packet<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let len = self.remaining().min(MAX_PACKET_SIZE);
        let packet = Packet {
            index: self.index,
            offset: self.offset,
            bytes: &self.data[self.offset..self.offset + len],
            requires_ack: (self.index + 1) % self.packets_per_ack == 0,
            is_last: self.index + 1 == self.total,
        };
        self.offset += len;
        self.index += 1;
        Some(packet)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.index;
        (left, Some(left))
    }
}

impl ExactSizeIterator for PacketStream<'_> {}

/// Keeps consecutive packet writes at least `interval` apart.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Sleep until the next write is allowed. The first call never sleeps.
    pub fn wait_turn(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
    }

    /// Record that a write just completed.
    pub fn mark(&mut self) {
        self.last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_packets_cover_image() {
        let flow = FlowController::default();
        for len in [0, 1, 19, 20, 21, 45, 299, 300, 310, 4096, 65535] {
            let image = ramp(len);
            let mut rebuilt = Vec::with_capacity(len);
            let mut expected_offset = 0;
            for packet in flow.packets(&image) {
                assert_eq!(packet.offset, expected_offset);
                assert!(!packet.bytes.is_empty() && packet.bytes.len() <= 20);
                expected_offset += packet.bytes.len();
                rebuilt.extend_from_slice(packet.bytes);
            }
            assert_eq!(rebuilt, image, "len {}", len);
        }
    }

    #[test]
    fn test_45_byte_image() {
        let image = ramp(45);
        let packets: Vec<_> = FlowController::default().packets(&image).collect();
        let sizes: Vec<_> = packets.iter().map(|p| p.bytes.len()).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
        assert!(packets.iter().all(|p| !p.requires_ack));
        assert!(packets[2].is_last);
        assert_eq!(packets[2].bytes, &image[40..]);
    }

    #[test]
    fn test_window_acks_310() {
        let image = ramp(310);
        let flow = FlowController::default();
        let packets: Vec<_> = flow.packets(&image).collect();
        assert_eq!(packets.len(), 16);
        assert_eq!(packets[15].bytes.len(), 10);

        let acks: Vec<_> = packets
            .iter()
            .filter(|p| p.requires_ack)
            .map(|p| p.index)
            .collect();
        assert_eq!(acks, vec![14]);
        assert!(packets[15].is_last);

        let plan = flow.plan(310);
        assert_eq!(plan.window_acks, 1);
        assert_eq!(plan.final_acks, 1);
        assert_eq!(plan.total_acks(), 2);
    }

    #[test]
    fn test_window_aligned_last_packet() {
        let image = ramp(300);
        let packets: Vec<_> = FlowController::default().packets(&image).collect();
        assert_eq!(packets.len(), 15);
        assert!(packets[14].requires_ack && packets[14].is_last);
        assert_eq!(FlowController::default().plan(300).total_acks(), 2);
    }

    #[test]
    fn test_empty_image_plan() {
        let flow = FlowController::default();
        assert_eq!(flow.packets(&[]).count(), 0);
        let plan = flow.plan(0);
        assert_eq!(plan.packets, 0);
        assert_eq!(plan.total_acks(), 1);
    }

    #[test]
    fn test_stream_progress() {
        let image = ramp(50);
        let mut stream = FlowController::default().packets(&image);
        assert_eq!(stream.len(), 3);
        stream.next();
        assert_eq!(stream.sent(), 1);
        assert_eq!(stream.bytes_sent(), 20);
        assert_eq!(stream.remaining(), 30);
        assert_eq!(stream.len(), 2);
    }

    #[test]
    fn test_pacer_interval() {
        let mut pacer = Pacer::new(Duration::from_millis(10));
        let start = Instant::now();
        pacer.wait_turn();
        assert!(start.elapsed() < Duration::from_millis(10));
        pacer.mark();
        pacer.wait_turn();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
