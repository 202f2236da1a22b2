use bit_set::BitSet;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::error::RdmError;
use crate::ids::{FabricAddr, TransferId};

/// What a packet entry's events are attributed to
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum XEntry {
    Tx(TransferId),
    Rx(TransferId),
    /// handshake packets belong to the peer rather than to a transfer
    Peer(FabricAddr),
}

impl XEntry {
    pub fn transfer_id(&self) -> Option<TransferId> {
        match self {
            XEntry::Tx(id) | XEntry::Rx(id) => Some(*id),
            XEntry::Peer(_) => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransferKind {
    Tx,
    Rx,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransferState {
    /// no data may go out before the peer's handshake is done
    WaitingHandshake,
    Active,
    /// completion was reported; the entry lingers while packets or queued control packets
    ///  still refer to it
    Completed,
    /// failure was reported, same lingering as for `Completed`
    Failed(RdmError),
}

pub struct TransferEntry {
    pub id: TransferId,
    pub kind: TransferKind,
    pub peer: FabricAddr,
    pub total_len: usize,
    /// tx: the message, rx: the reassembly buffer
    pub data: BytesMut,
    pub delivery_complete: bool,
    pub state: TransferState,

    pub packets_posted: usize,
    pub bytes_posted: usize,
    pub bytes_sent: usize,
    pub receipt_received: bool,

    /// rx: the sender's message id
    pub remote_msg_id: Option<TransferId>,
    pub bytes_copied: usize,
    /// rx: data packets placed so far, by their index in the message
    pub received_segments: BitSet,

    /// packets handed to the fabric (or waiting in an RNR queue) whose completion is pending
    pub outstanding_packets: usize,
    /// requests for this transfer in a per-peer control queue
    pub queued_ctrl: usize,
}

impl TransferEntry {
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TransferState::Completed | TransferState::Failed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, TransferState::Failed(_))
    }

    pub fn all_posted(&self) -> bool {
        self.packets_posted > 0 && self.bytes_posted >= self.total_len
    }

    pub fn is_referenced(&self) -> bool {
        self.outstanding_packets > 0 || self.queued_ctrl > 0
    }
}

/// The endpoint's tx and rx entries. Rx entries are additionally indexed by the sender's
///  message id.
#[derive(Default)]
pub struct TransferTable {
    entries: FxHashMap<TransferId, TransferEntry>,
    rx_by_remote: FxHashMap<(FabricAddr, TransferId), TransferId>,
    next_id: u32,
}

impl TransferTable {
    fn new_id(&mut self) -> TransferId {
        loop {
            let id = TransferId::from_raw(self.next_id);
            self.next_id = id.next().to_raw();
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert_tx(&mut self, peer: FabricAddr, msg: &[u8], delivery_complete: bool) -> TransferId {
        let id = self.new_id();
        trace!("new tx entry {} for {} with {} bytes", id, peer, msg.len());
        self.entries.insert(id, TransferEntry {
            id,
            kind: TransferKind::Tx,
            peer,
            total_len: msg.len(),
            data: BytesMut::from(msg),
            delivery_complete,
            state: TransferState::WaitingHandshake,
            packets_posted: 0,
            bytes_posted: 0,
            bytes_sent: 0,
            receipt_received: false,
            remote_msg_id: None,
            bytes_copied: 0,
            received_segments: BitSet::new(),
            outstanding_packets: 0,
            queued_ctrl: 0,
        });
        id
    }

    pub fn insert_rx(&mut self, peer: FabricAddr, remote_msg_id: TransferId, total_len: usize, delivery_complete: bool) -> TransferId {
        let id = self.new_id();
        trace!("new rx entry {} for message {} from {} with {} bytes", id, remote_msg_id, peer, total_len);
        self.entries.insert(id, TransferEntry {
            id,
            kind: TransferKind::Rx,
            peer,
            total_len,
            data: BytesMut::zeroed(total_len),
            delivery_complete,
            state: TransferState::Active,
            packets_posted: 0,
            bytes_posted: 0,
            bytes_sent: 0,
            receipt_received: false,
            remote_msg_id: Some(remote_msg_id),
            bytes_copied: 0,
            received_segments: BitSet::new(),
            outstanding_packets: 0,
            queued_ctrl: 0,
        });
        self.rx_by_remote.insert((peer, remote_msg_id), id);
        id
    }

    pub fn find_rx(&self, peer: FabricAddr, remote_msg_id: TransferId) -> Option<TransferId> {
        self.rx_by_remote.get(&(peer, remote_msg_id)).cloned()
    }

    pub fn get(&self, id: TransferId) -> Option<&TransferEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: TransferId) -> Option<&mut TransferEntry> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: TransferId) -> Option<TransferEntry> {
        let removed = self.entries.remove(&id)?;
        if let Some(remote_msg_id) = removed.remote_msg_id {
            self.rx_by_remote.remove(&(removed.peer, remote_msg_id));
        }
        Some(removed)
    }

    pub fn ids_for_peer(&self, peer: FabricAddr) -> Vec<TransferId> {
        let mut result = self.entries.values()
            .filter(|e| e.peer == peer)
            .map(|e| e.id)
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    /// rx entries from `peer` that are still waiting for data
    pub fn num_open_rx(&self, peer: FabricAddr) -> usize {
        self.entries.values()
            .filter(|e| e.kind == TransferKind::Rx && e.peer == peer && !e.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// hands the assembled message over, leaving the entry's buffer empty
    pub fn take_data(&mut self, id: TransferId) -> Bytes {
        self.entries.get_mut(&id)
            .map(|e| std::mem::take(&mut e.data).freeze())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_index() {
        let mut table = TransferTable::default();
        let peer = FabricAddr::from_raw(3);

        let rx = table.insert_rx(peer, TransferId::from_raw(17), 10, false);
        assert_eq!(table.find_rx(peer, TransferId::from_raw(17)), Some(rx));
        assert_eq!(table.find_rx(FabricAddr::from_raw(4), TransferId::from_raw(17)), None);
        assert_eq!(table.get(rx).unwrap().data.len(), 10);

        table.remove(rx);
        assert_eq!(table.find_rx(peer, TransferId::from_raw(17)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let mut table = TransferTable::default();
        table.next_id = u32::MAX;

        let a = table.insert_tx(FabricAddr::from_raw(1), b"a", false);
        let b = table.insert_tx(FabricAddr::from_raw(1), b"b", false);
        table.next_id = a.to_raw();
        let c = table.insert_tx(FabricAddr::from_raw(1), b"c", false);

        assert_eq!(a, TransferId::from_raw(u32::MAX));
        assert_eq!(b, TransferId::from_raw(0));
        assert_eq!(c, TransferId::from_raw(1));
        assert_eq!(table.ids_for_peer(FabricAddr::from_raw(1)), vec![b, c, a]);
    }

    #[test]
    fn test_all_posted() {
        let mut table = TransferTable::default();
        let id = table.insert_tx(FabricAddr::from_raw(1), b"", false);
        let tx = table.get_mut(id).unwrap();
        assert!(!tx.all_posted());

        // a zero-length message still takes a packet
        tx.packets_posted = 1;
        assert!(tx.all_posted());
    }
}
