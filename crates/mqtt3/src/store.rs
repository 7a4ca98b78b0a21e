//! Outbound delivery store: every QoS>0 PUBLISH and every PUBREL lives
//! here, keyed by packet identifier and the response type that retires
//! it, until the terminal acknowledgement arrives. Session replay walks
//! the entries in original send order.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::flags;
use crate::packet::PacketType;

#[derive(Debug, Clone)]
pub(crate) struct StoreEntry {
    packet_id: u16,
    expected: PacketType,
    bytes: Vec<u8>,
}

impl StoreEntry {
    pub fn new(packet_id: u16, expected: PacketType, bytes: Vec<u8>) -> Self {
        Self {
            packet_id,
            expected,
            bytes,
        }
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    pub fn expected(&self) -> PacketType {
        self.expected
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Flips the DUP bit of the already-serialized fixed header.
    fn set_dup(&mut self) {
        if let Some(first) = self.bytes.first_mut() {
            *first |= flags::PUBLISH_DUP;
        }
    }
}

/// Indexed collection of in-flight outbound packets.
///
/// Three access orders: unique lookup by `(packet_id, expected)` when a
/// response arrives, by `packet_id` alone for caller cleanup, and
/// insertion order for session replay.
#[derive(Debug, Default)]
pub(crate) struct DeliveryStore {
    next_seq: u64,
    by_seq: BTreeMap<u64, StoreEntry>,
    index: BTreeMap<(u16, PacketType), u64>,
}

impl DeliveryStore {
    /// Inserts an entry. A duplicate `(packet_id, expected)` key leaves
    /// the existing entry in place and returns false.
    pub fn insert(&mut self, entry: StoreEntry) -> bool {
        let key = (entry.packet_id, entry.expected);
        if self.index.contains_key(&key) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(key, seq);
        self.by_seq.insert(seq, entry);
        true
    }

    pub fn remove(&mut self, packet_id: u16, expected: PacketType) -> Option<StoreEntry> {
        let seq = self.index.remove(&(packet_id, expected))?;
        self.by_seq.remove(&seq)
    }

    /// Removes every entry stored under `packet_id`.
    pub fn remove_all(&mut self, packet_id: u16) -> usize {
        let keys: Vec<((u16, PacketType), u64)> = self
            .index
            .range((packet_id, PacketType::Connect)..=(packet_id, PacketType::Disconnect))
            .map(|(key, seq)| (*key, *seq))
            .collect();
        for (key, seq) in &keys {
            self.index.remove(key);
            self.by_seq.remove(seq);
        }
        keys.len()
    }

    pub fn contains(&self, packet_id: u16, expected: PacketType) -> bool {
        self.index.contains_key(&(packet_id, expected))
    }

    pub fn clear(&mut self) {
        self.by_seq.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &StoreEntry> {
        self.by_seq.values()
    }

    /// Prepares session replay: sets DUP on entries still awaiting
    /// PUBACK or PUBREC (stored PUBRELs go out unchanged) and returns
    /// the wire bytes of every entry in original send order.
    pub fn replay_packets(&mut self) -> Vec<Bytes> {
        let mut packets = Vec::with_capacity(self.by_seq.len());
        for entry in self.by_seq.values_mut() {
            if matches!(entry.expected, PacketType::PubAck | PacketType::PubRec) {
                entry.set_dup();
            }
            packets.push(Bytes::copy_from_slice(&entry.bytes));
        }
        packets
    }
}
