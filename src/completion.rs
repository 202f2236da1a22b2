//! Translation of the fabric's completions into protocol progress, and the single place where
//!  transfers reach their terminal state.
//!
//! Every transfer is reported to the [crate::completion_sink::CompletionSink] exactly once. A
//!  transfer entry stays in the table after that as long as packets or queued control requests
//!  still refer to it, so late completions find it and are accounted for silently.

use tracing::{debug, trace, warn};
use crate::buffers::packet_pool::PacketOwner;
use crate::end_point::{Endpoint, WorkItem};
use crate::error::{prov_errno, RdmError};
use crate::exponential_backoff::ExponentialBackoff;
use crate::fabric::LowerPath;
use crate::ids::{FabricAddr, PacketEntryId, TransferId};
use crate::packet_header::{EagerHeader, PacketHeader, PacketType};
use crate::transfer::{TransferKind, TransferState, XEntry};

impl Endpoint {
    pub(crate) fn handle_work_item(&mut self, item: WorkItem) {
        match item {
            WorkItem::SendDone(pkt) => self.handle_send_completion(pkt),
            WorkItem::SendFailed { pkt, err, prov_errno } => self.handle_send_error(pkt, err, prov_errno),
            WorkItem::Received { pkt, lower } => self.handle_recv_completion(pkt, lower),
            WorkItem::RecvFailed { pkt, err, prov_errno } => self.handle_recv_error(pkt, err, prov_errno),
        }
    }

    /// A send completed successfully. The packet's transfer is credited, and the entry goes
    ///  back to the pool.
    pub fn handle_send_completion(&mut self, pkt: PacketEntryId) {
        let entry = self.pool.entry(pkt);
        let x_entry = entry.x_entry;
        let addr = entry.addr;
        let peer_generation = entry.peer_generation;
        let data_len = entry.data_len;
        trace!("send completion for {} ({:?}) to {:?}", pkt, entry.packet_type(), addr);

        if let Some(peer) = self.sent_to_peer_mut(addr, peer_generation) {
            peer.tx_pending = peer.tx_pending.saturating_sub(1);
            if !peer.in_backoff() {
                if let Some(backoff) = &mut peer.backoff {
                    backoff.reset();
                }
            }
        }

        match x_entry {
            Some(XEntry::Tx(id)) => {
                if let Some(tx) = self.transfers.get_mut(id) {
                    tx.outstanding_packets -= 1;
                    tx.bytes_sent += data_len;
                }
                self.check_tx_completed(id);
            }
            Some(XEntry::Rx(id)) => {
                if let Some(rx) = self.transfers.get_mut(id) {
                    rx.outstanding_packets -= 1;
                }
                self.release_transfer_if_done(id);
            }
            Some(XEntry::Peer(_)) => {}
            None => warn!("send completion for {} which belongs to nothing", pkt),
        }

        self.pool.release(pkt);
    }

    /// A send failed. RNR ("receiver not ready") is not an error: the packet is queued for a
    ///  resend after a backoff, and the peer gets nothing else until then. Any other error
    ///  fails the packet's transfer, or for packets owned by a peer, its handshake.
    pub fn handle_send_error(&mut self, pkt: PacketEntryId, err: i32, prov_errno: i32) {
        let entry = self.pool.entry(pkt);
        let x_entry = entry.x_entry;
        let addr = entry.addr;
        let peer_generation = entry.peer_generation;
        let packet_type = entry.packet_type();

        if prov_errno == prov_errno::RNR {
            let peer = addr.and_then(|a| self.peers.get_mut(&a))
                .filter(|p| p.generation() == peer_generation);
            if let Some(peer) = peer {
                debug!("{} to {} hit RNR, resending after backoff", pkt, peer.addr());
                self.pool.move_to(pkt, PacketOwner::CompletionPending, PacketOwner::Queued);
                peer.rnr_queue.push_back(pkt);
                let config = &self.config;
                peer.backoff.get_or_insert_with(|| ExponentialBackoff::new(config));
                return;
            }
        }

        let error = RdmError::Transport { err, prov_errno };
        warn!("send of {} ({:?}) to {:?} failed: {}", pkt, packet_type, addr, error);

        match self.sent_to_peer_mut(addr, peer_generation) {
            Some(peer) => peer.tx_pending = peer.tx_pending.saturating_sub(1),
            None => {
                if let Some(XEntry::Peer(_)) = x_entry {
                    debug!("{} was sent to a peer that was removed since - ignoring the error", pkt);
                    self.pool.release(pkt);
                    return;
                }
            }
        }

        match (x_entry, packet_type) {
            (Some(x_entry), Some(ctrl_type)) if ctrl_type != PacketType::Eager => {
                if let Some(t) = x_entry.transfer_id().and_then(|id| self.transfers.get_mut(id)) {
                    t.outstanding_packets -= 1;
                }
                self.handle_ctrl_failure(x_entry, ctrl_type, addr, error);
            }
            (Some(XEntry::Tx(id)), _) | (Some(XEntry::Rx(id)), _) => {
                if let Some(t) = self.transfers.get_mut(id) {
                    t.outstanding_packets -= 1;
                }
                self.fail_transfer(id, error);
            }
            _ => self.sink.on_endpoint_error(addr, error),
        }

        self.pool.release(pkt);
    }

    /// A packet arrived in a posted receive buffer. Its header decides what it means for the
    ///  protocol; the buffer itself is posted again afterwards.
    pub fn handle_recv_completion(&mut self, pkt: PacketEntryId, lower: LowerPath) {
        let Some(src) = self.pool.entry(pkt).addr else {
            warn!("received {} without source address - dropping", pkt);
            self.recycle_rx(pkt);
            return;
        };

        if lower == LowerPath::SharedMemory && !self.peer_mut(src).is_local {
            warn!("packet from {} on the shared memory path, but the peer is not local - dropping", src);
            self.recycle_rx(pkt);
            return;
        }

        #[cfg(any(debug_assertions, feature = "packet-dump"))]
        crate::debug::print_packet("recv", self, pkt);

        let buf = self.pool.entry(pkt).buf();
        let mut parse_buf = buf;
        let header = PacketHeader::deser(&mut parse_buf);
        let header_len = buf.len() - parse_buf.len();

        match header {
            Ok(PacketHeader::HandshakeRequest { features }) => {
                self.on_handshake_received(src, features);
                if let Err(e) = self.post_ctrl_or_queue(XEntry::Peer(src), PacketType::Handshake, false) {
                    warn!("could not answer handshake request from {}: {}", src, e);
                    self.sink.on_endpoint_error(Some(src), e);
                }
            }
            Ok(PacketHeader::Handshake { features }) => self.on_handshake_received(src, features),
            Ok(PacketHeader::Eager(eager)) => self.handle_eager(pkt, src, eager, header_len),
            Ok(PacketHeader::Receipt { msg_id }) => self.handle_receipt(src, msg_id),
            Err(e) => warn!("unparseable packet from {}: {} - dropping", src, e),
        }

        self.recycle_rx(pkt);
    }

    fn handle_eager(&mut self, pkt: PacketEntryId, src: FabricAddr, eager: EagerHeader, header_len: usize) {
        let total_len = eager.total_len as usize;
        let offset = eager.offset as usize;
        let payload_len = self.pool.entry(pkt).buf().len() - header_len;
        let max_payload = self.config.max_data_payload();

        let rx = match self.transfers.find_rx(src, eager.msg_id) {
            Some(rx) => rx,
            None => {
                if total_len > self.config.max_message_size {
                    warn!("message {} from {} has {} bytes, more than the maximum of {}", eager.msg_id, src, total_len, self.config.max_message_size);
                    self.sink.on_endpoint_error(Some(src), RdmError::MessageTooLong { len: total_len, max: self.config.max_message_size });
                    return;
                }
                if self.transfers.num_open_rx(src) >= self.config.max_open_rx_per_peer {
                    warn!("{} incomplete messages from {} already, dropping data for message {}", self.config.max_open_rx_per_peer, src, eager.msg_id);
                    self.sink.on_endpoint_error(Some(src), RdmError::TooManyOpenMessages(src));
                    return;
                }
                self.transfers.insert_rx(src, eager.msg_id, total_len, eager.delivery_complete)
            }
        };
        self.pool.entry_mut(pkt).x_entry = Some(XEntry::Rx(rx));

        let Some(rx_entry) = self.transfers.get_mut(rx) else {
            return;
        };
        if rx_entry.is_terminal() {
            debug!("data for {} which is finished already - dropping", rx);
            return;
        }
        if total_len != rx_entry.total_len || offset + payload_len > rx_entry.total_len || offset % max_payload != 0 {
            warn!("data for {} at offset {} with {} bytes does not fit a message of {} bytes", rx, offset, payload_len, rx_entry.total_len);
            self.fail_transfer(rx, RdmError::MalformedPacket(src));
            return;
        }
        if !rx_entry.received_segments.insert(offset / max_payload) {
            debug!("duplicate data for {} at offset {} - dropping", rx, offset);
            return;
        }

        rx_entry.data[offset..offset + payload_len].copy_from_slice(&self.pool.entry(pkt).buf()[header_len..]);
        self.handle_data_copied(pkt, payload_len);
    }

    /// `data_size` bytes from a received data packet were placed into its rx entry. When the
    ///  whole message is there, the rx entry completes, and a receipt is sent if the sender
    ///  asked for delivery complete.
    pub fn handle_data_copied(&mut self, pkt: PacketEntryId, data_size: usize) {
        let Some(XEntry::Rx(rx)) = self.pool.entry(pkt).x_entry else {
            warn!("data copied from {} which belongs to no rx entry", pkt);
            return;
        };
        let Some(rx_entry) = self.transfers.get_mut(rx) else {
            return;
        };

        rx_entry.bytes_copied += data_size;
        trace!("{}: {} of {} bytes copied", rx, rx_entry.bytes_copied, rx_entry.total_len);
        if rx_entry.is_terminal() || rx_entry.bytes_copied < rx_entry.total_len {
            return;
        }

        let delivery_complete = rx_entry.delivery_complete;
        let peer = rx_entry.peer;
        self.complete_transfer(rx);

        if delivery_complete {
            if let Err(e) = self.post_ctrl_or_queue(XEntry::Rx(rx), PacketType::Receipt, false) {
                warn!("could not send receipt for {} to {}: {}", rx, peer, e);
                self.sink.on_endpoint_error(Some(peer), e);
            }
        }
        self.release_transfer_if_done(rx);
    }

    fn handle_receipt(&mut self, src: FabricAddr, msg_id: TransferId) {
        match self.transfers.get_mut(msg_id) {
            Some(tx) if tx.kind == TransferKind::Tx && tx.peer == src && tx.delivery_complete => {
                trace!("receipt for {} from {}", msg_id, src);
                tx.receipt_received = true;
                self.check_tx_completed(msg_id);
            }
            _ => debug!("receipt from {} for unknown message {} - ignoring", src, msg_id),
        }
    }

    /// A posted receive buffer came back with an error. The error goes to the rx entry the
    ///  buffer belongs to if there is one, and is reported for the endpoint otherwise.
    pub fn handle_recv_error(&mut self, pkt: PacketEntryId, err: i32, prov_errno: i32) {
        let entry = self.pool.entry(pkt);
        let x_entry = entry.x_entry;
        let addr = entry.addr;
        let error = RdmError::Transport { err, prov_errno };
        warn!("receive error on {} from {:?}: {}", pkt, addr, error);

        match x_entry.and_then(|x| x.transfer_id()) {
            Some(id) => self.fail_transfer(id, error),
            None => self.sink.on_endpoint_error(addr, error),
        }

        self.recycle_rx(pkt);
    }

    /// Posts a receive buffer again after its completion was processed
    fn recycle_rx(&mut self, pkt: PacketEntryId) {
        let entry = self.pool.entry_mut(pkt);
        let lower = entry.lower;
        entry.recycle();

        match self.fabric.post_recv(lower, pkt) {
            Ok(()) => self.pool.move_to(pkt, PacketOwner::CompletionPending, PacketOwner::InFlight),
            Err(e) => {
                debug!("could not repost receive buffer {}: {} - retrying later", pkt, e);
                self.pool.release(pkt);
                *self.rx_repost_deficit.entry(lower).or_default() += 1;
            }
        }
    }

    fn check_tx_completed(&mut self, id: TransferId) {
        let Some(tx) = self.transfers.get(id) else {
            return;
        };
        if !tx.is_terminal()
            && tx.all_posted()
            && tx.outstanding_packets == 0
            && (!tx.delivery_complete || tx.receipt_received)
        {
            self.complete_transfer(id);
        }
        self.release_transfer_if_done(id);
    }

    pub(crate) fn complete_transfer(&mut self, id: TransferId) {
        let Some(t) = self.transfers.get_mut(id) else {
            return;
        };
        if t.is_terminal() {
            debug!("{} was reported already", id);
            return;
        }
        t.state = TransferState::Completed;
        let kind = t.kind;
        let peer = t.peer;

        match kind {
            TransferKind::Tx => {
                debug!("{} to {} complete", id, peer);
                self.sink.on_send_complete(id);
            }
            TransferKind::Rx => {
                let msg = self.transfers.take_data(id);
                debug!("{} from {} complete with {} bytes", id, peer, msg.len());
                self.sink.on_recv_complete(id, peer, msg);
            }
        }
    }

    /// Fails a transfer and reports it, unless it reached its terminal state before. Packets
    ///  of the transfer that are still in flight complete silently.
    pub(crate) fn fail_transfer(&mut self, id: TransferId, err: RdmError) {
        let Some(t) = self.transfers.get_mut(id) else {
            debug!("{} failed after it was released: {}", id, err);
            return;
        };
        if t.is_terminal() {
            debug!("{} was reported already, suppressing {}", id, err);
            self.release_transfer_if_done(id);
            return;
        }
        t.state = TransferState::Failed(err.clone());
        let kind = t.kind;
        let peer = t.peer;
        warn!("{} with {} failed: {}", id, peer, err);

        self.pending_data.retain(|x| *x != id);
        if let Some(p) = self.peers.get_mut(&peer) {
            p.blocked_sends.retain(|x| *x != id);
        }

        match kind {
            TransferKind::Tx => self.sink.on_send_error(id, err),
            TransferKind::Rx => self.sink.on_recv_error(id, err),
        }
        self.release_transfer_if_done(id);
    }

    /// Removes a transfer once it is reported and nothing refers to it anymore
    pub(crate) fn release_transfer_if_done(&mut self, id: TransferId) {
        let done = self.transfers.get(id)
            .map(|t| t.is_terminal() && !t.is_referenced())
            .unwrap_or(false);
        if done {
            trace!("releasing {}", id);
            self.transfers.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::end_point::SendOptions;
    use crate::error::errno;
    use crate::packet_header::PeerFeatures;
    use crate::peer::HandshakeState;
    use crate::test_util::{progress_until_idle, sim_endpoint, test_config, RecordingSink, SimNetwork, SinkEvent};
    use super::*;

    const A: FabricAddr = FabricAddr::from_raw(1);
    const B: FabricAddr = FabricAddr::from_raw(2);

    /// two endpoints that are done with their handshake
    fn connected(net: &SimNetwork) -> ((Endpoint, Arc<RecordingSink>), (Endpoint, Arc<RecordingSink>)) {
        let (mut a, sink_a) = sim_endpoint(net, A, test_config());
        let (mut b, sink_b) = sim_endpoint(net, B, test_config());
        a.trigger_handshake(B).unwrap();
        progress_until_idle(&mut [&mut a, &mut b]);
        assert_eq!(a.handshake_state(B), HandshakeState::Ready);
        ((a, sink_a), (b, sink_b))
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2], vec![])]
    #[case::reversed(vec![2, 1, 0], vec![])]
    #[case::mixed(vec![1, 2, 0], vec![])]
    #[case::first_fails(vec![0, 1, 2], vec![0])]
    #[case::first_fails_last(vec![1, 2, 0], vec![0])]
    #[case::middle_fails_last(vec![0, 2, 1], vec![1])]
    #[case::last_fails_first(vec![2, 0, 1], vec![2])]
    #[case::two_fail(vec![0, 1, 2], vec![0, 2])]
    #[case::all_fail(vec![2, 1, 0], vec![0, 1, 2])]
    fn test_exactly_one_terminal_notification(#[case] completion_order: Vec<usize>, #[case] failing: Vec<usize>) {
        let net = SimNetwork::new();
        let ((mut a, sink_a), _b) = connected(&net);

        net.hold_send_completions(A, true);
        // three data packets
        let tx = a.send_msg(B, &[1u8; 120], SendOptions::default()).unwrap();
        assert_eq!(net.num_held_send_completions(A), 3);

        for i in completion_order {
            if failing.contains(&i) {
                net.fail_held_send_completion(A, i, errno::EIO, prov_errno::UNREACHABLE);
            }
            else {
                net.release_held_send_completion(A, i);
            }
            a.progress();
        }
        a.progress();

        let expected = if failing.is_empty() {
            SinkEvent::SendComplete(tx)
        }
        else {
            SinkEvent::SendError(tx, RdmError::Transport { err: errno::EIO, prov_errno: prov_errno::UNREACHABLE })
        };
        assert_eq!(sink_a.events(), vec![expected]);
        assert_eq!(a.num_transfers(), 0);
        assert_eq!(a.pending_sends(B), 0);
        assert_eq!(a.num_free_packets(), 16);
    }

    #[test]
    fn test_send_completion_releases_packet() {
        let net = SimNetwork::new();
        let ((mut a, _), _b) = connected(&net);

        a.send_msg(B, b"abc", SendOptions::default()).unwrap();
        assert_eq!(a.num_free_packets(), 15);
        assert_eq!(a.pending_sends(B), 1);

        a.progress();
        assert_eq!(a.num_free_packets(), 16);
        assert_eq!(a.pending_sends(B), 0);
        assert_eq!(a.pool.count_owned_by(PacketOwner::CompletionPending), 0);
    }

    #[test]
    fn test_data_copied_completes_at_full_length() {
        let net = SimNetwork::new();
        let (mut a, sink_a) = sim_endpoint(&net, A, test_config());
        let rx = a.transfers.insert_rx(B, TransferId::from_raw(9), 10, false);

        let pkt = a.pool.alloc().unwrap();
        a.pool.entry_mut(pkt).x_entry = Some(XEntry::Rx(rx));

        a.handle_data_copied(pkt, 4);
        assert!(sink_a.events().is_empty());
        a.handle_data_copied(pkt, 6);
        assert_eq!(sink_a.events(), vec![SinkEvent::RecvComplete(rx, B, vec![0u8; 10].into())]);
        assert_eq!(a.num_transfers(), 0);

        // a duplicate after completion changes nothing
        a.handle_data_copied(pkt, 6);
        assert_eq!(sink_a.events().len(), 1);
        a.pool.release(pkt);
    }

    #[test]
    fn test_zero_length_message() {
        let net = SimNetwork::new();
        let ((mut a, sink_a), (mut b, sink_b)) = connected(&net);

        let tx = a.send_msg(B, &[], SendOptions::default()).unwrap();
        progress_until_idle(&mut [&mut a, &mut b]);

        assert_eq!(sink_a.events(), vec![SinkEvent::SendComplete(tx)]);
        assert_eq!(sink_b.received_messages(), vec![(A, Bytes::new())]);
    }

    #[test]
    fn test_recv_error_without_transfer() {
        let net = SimNetwork::new();
        let (mut b, sink_b) = sim_endpoint(&net, B, test_config());

        assert!(net.deliver_recv_error(B, LowerPath::Fabric, Some(A), errno::EIO, prov_errno::CHECKSUM));
        assert_eq!(net.num_posted_recvs(B, LowerPath::Fabric), 7);
        b.progress();

        assert_eq!(sink_b.events(), vec![SinkEvent::EndpointError(Some(A), RdmError::Transport { err: errno::EIO, prov_errno: prov_errno::CHECKSUM })]);
        assert_eq!(net.num_posted_recvs(B, LowerPath::Fabric), 8);
    }

    #[test]
    fn test_truncated_receive() {
        let net = SimNetwork::new();
        let (mut b, sink_b) = sim_endpoint(&net, B, test_config());

        assert!(net.deliver_raw(A, B, LowerPath::Fabric, &[0u8; 100]));
        b.progress();

        assert_eq!(sink_b.events(), vec![SinkEvent::EndpointError(Some(A), RdmError::Transport { err: errno::EMSGSIZE, prov_errno: prov_errno::TRUNCATED })]);
        assert_eq!(net.num_posted_recvs(B, LowerPath::Fabric), 8);
    }

    #[test]
    fn test_garbage_is_dropped() {
        let net = SimNetwork::new();
        let (mut b, sink_b) = sim_endpoint(&net, B, test_config());

        assert!(net.deliver_raw(A, B, LowerPath::Fabric, &[99, 1, 2, 3]));
        b.progress();

        assert!(sink_b.events().is_empty());
        assert_eq!(b.handshake_state(A), HandshakeState::Uninitialized);
        assert_eq!(net.num_posted_recvs(B, LowerPath::Fabric), 8);
    }

    #[test]
    fn test_malformed_data_fails_rx() {
        let net = SimNetwork::new();
        let (mut b, sink_b) = sim_endpoint(&net, B, test_config());

        let mut packet = Vec::new();
        PacketHeader::Eager(EagerHeader { msg_id: TransferId::from_raw(3), delivery_complete: false, total_len: 10, offset: 8 })
            .ser(&mut packet);
        packet.extend_from_slice(&[1, 2, 3, 4]);
        assert!(net.deliver_raw(A, B, LowerPath::Fabric, &packet));
        b.progress();

        let events = sink_b.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SinkEvent::RecvError(_, RdmError::MalformedPacket(A))));
        assert_eq!(b.num_transfers(), 0);
    }

    #[test]
    fn test_rnr_is_retried() {
        let net = SimNetwork::new();
        let (mut a, sink_a) = sim_endpoint(&net, A, test_config());
        let mut config_b = test_config();
        config_b.rx_pool_size = 2;
        let (mut b, sink_b) = sim_endpoint(&net, B, config_b);

        a.trigger_handshake(B).unwrap();
        progress_until_idle(&mut [&mut a, &mut b]);

        // four data packets, but b has only two receive buffers
        let msg = (0..160u32).map(|i| i as u8).collect::<Vec<_>>();
        let tx = a.send_msg(B, &msg, SendOptions::default()).unwrap();
        a.progress();
        assert!(a.has_pending_work());
        assert!(sink_a.events().is_empty());

        progress_until_idle(&mut [&mut a, &mut b]);
        assert_eq!(sink_a.events(), vec![SinkEvent::SendComplete(tx)]);
        assert_eq!(sink_b.received_messages(), vec![(A, Bytes::from(msg))]);
        assert_eq!(a.num_free_packets(), 16);
    }

    #[test]
    fn test_delivery_complete_waits_for_receipt() {
        let net = SimNetwork::new();
        let ((mut a, sink_a), (mut b, sink_b)) = connected(&net);

        let tx = a.send_msg(B, b"important", SendOptions { delivery_complete: true }).unwrap();
        a.progress();
        assert!(sink_a.events().is_empty());
        assert_eq!(a.num_transfers(), 1);

        b.progress();
        assert_eq!(sink_b.received_messages().len(), 1);
        assert!(net.submissions(B).iter().any(|s| s.packet_type() == Some(PacketType::Receipt)));

        progress_until_idle(&mut [&mut a, &mut b]);
        assert_eq!(sink_a.events(), vec![SinkEvent::SendComplete(tx)]);
        assert_eq!(a.num_transfers(), 0);
        assert_eq!(b.num_transfers(), 0);
    }

    #[test]
    fn test_failed_receipt_is_reported_for_the_endpoint() {
        let net = SimNetwork::new();
        let ((mut a, _sink_a), (mut b, sink_b)) = connected(&net);

        net.fail_next_send_completions(B, 1, errno::EIO, prov_errno::UNREACHABLE);
        a.send_msg(B, b"important", SendOptions { delivery_complete: true }).unwrap();
        progress_until_idle(&mut [&mut a, &mut b]);

        let events = sink_b.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SinkEvent::RecvComplete(_, from, msg) if *from == A && msg.as_ref() == b"important"));
        assert_eq!(events[1], SinkEvent::EndpointError(Some(A), RdmError::Transport { err: errno::EIO, prov_errno: prov_errno::UNREACHABLE }));
        assert_eq!(b.num_transfers(), 0);
        assert_eq!(b.num_free_packets(), 16);
    }

    fn eager_packet(msg_id: u32, msg: &[u8], offset: usize, len: usize) -> Vec<u8> {
        let mut packet = Vec::new();
        PacketHeader::Eager(EagerHeader { msg_id: TransferId::from_raw(msg_id), delivery_complete: false, total_len: msg.len() as u32, offset: offset as u32 })
            .ser(&mut packet);
        packet.extend_from_slice(&msg[offset..offset + len]);
        packet
    }

    #[test]
    fn test_duplicate_data_is_ignored() {
        let net = SimNetwork::new();
        let (mut b, sink_b) = sim_endpoint(&net, B, test_config());
        let msg = (0..60u8).collect::<Vec<_>>();

        let first = eager_packet(3, &msg, 0, 47);
        assert!(net.deliver_raw(A, B, LowerPath::Fabric, &first));
        assert!(net.deliver_raw(A, B, LowerPath::Fabric, &first));
        b.progress();
        assert!(sink_b.events().is_empty());
        assert_eq!(b.num_transfers(), 1);

        assert!(net.deliver_raw(A, B, LowerPath::Fabric, &eager_packet(3, &msg, 47, 13)));
        b.progress();
        assert_eq!(sink_b.received_messages(), vec![(A, Bytes::from(msg))]);
        assert_eq!(b.num_transfers(), 0);
    }

    #[test]
    fn test_unaligned_data_fails_rx() {
        let net = SimNetwork::new();
        let (mut b, sink_b) = sim_endpoint(&net, B, test_config());
        let msg = [5u8; 60];

        assert!(net.deliver_raw(A, B, LowerPath::Fabric, &eager_packet(4, &msg, 10, 20)));
        b.progress();

        let events = sink_b.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SinkEvent::RecvError(_, RdmError::MalformedPacket(A))));
    }

    #[test]
    fn test_open_rx_entries_per_peer_are_bounded() {
        let net = SimNetwork::new();
        let (mut b, sink_b) = sim_endpoint(&net, B, test_config());
        let msg = [1u8; 60];

        // only the first packet of each message, so none of them completes
        for msg_id in 0..5 {
            assert!(net.deliver_raw(A, B, LowerPath::Fabric, &eager_packet(msg_id, &msg, 0, 47)));
        }
        b.progress();
        assert_eq!(sink_b.events(), vec![SinkEvent::EndpointError(Some(A), RdmError::TooManyOpenMessages(A))]);
        assert_eq!(b.num_transfers(), 4);

        // completing one makes room for a new one
        assert!(net.deliver_raw(A, B, LowerPath::Fabric, &eager_packet(0, &msg, 47, 13)));
        assert!(net.deliver_raw(A, B, LowerPath::Fabric, &eager_packet(9, &msg, 0, 47)));
        b.progress();
        assert_eq!(sink_b.events().len(), 2);
        assert_eq!(sink_b.received_messages().len(), 1);
        assert_eq!(b.num_transfers(), 4);
    }

    #[test]
    fn test_delivery_complete_unsupported_by_peer() {
        let net = SimNetwork::new();
        let (mut a, sink_a) = sim_endpoint(&net, A, test_config());
        let mut config_b = test_config();
        config_b.features = PeerFeatures::empty();
        let (mut b, _) = sim_endpoint(&net, B, config_b);

        let tx = a.send_msg(B, b"important", SendOptions { delivery_complete: true }).unwrap();
        progress_until_idle(&mut [&mut a, &mut b]);

        assert_eq!(sink_a.events(), vec![SinkEvent::SendError(tx, RdmError::Unsupported(B, "delivery complete"))]);
        assert!(!net.submissions(A).iter().any(|s| s.packet_type() == Some(PacketType::Eager)));
    }

    #[test]
    fn test_shared_memory_path() {
        let net = SimNetwork::new();
        let mut config = test_config();
        config.shm_enabled = true;
        let (mut a, sink_a) = sim_endpoint(&net, A, config.clone());
        let (mut b, sink_b) = sim_endpoint(&net, B, config);
        net.set_local(A, B);

        let tx = a.send_msg(B, b"local", SendOptions::default()).unwrap();
        progress_until_idle(&mut [&mut a, &mut b]);

        assert_eq!(sink_a.events(), vec![SinkEvent::SendComplete(tx)]);
        assert_eq!(sink_b.received_messages(), vec![(A, Bytes::from_static(b"local"))]);
        assert!(net.submissions(A).iter().all(|s| s.lower == LowerPath::SharedMemory));
    }

    #[test]
    fn test_shared_memory_packet_from_remote_peer_is_dropped() {
        let net = SimNetwork::new();
        let mut config = test_config();
        config.shm_enabled = true;
        let (mut b, _) = sim_endpoint(&net, B, config);

        let mut packet = Vec::new();
        PacketHeader::HandshakeRequest { features: PeerFeatures::all() }.ser(&mut packet);
        assert!(net.deliver_raw(A, B, LowerPath::SharedMemory, &packet));
        b.progress();

        assert_eq!(b.handshake_state(A), HandshakeState::Uninitialized);
        assert_eq!(net.num_posted_recvs(B, LowerPath::SharedMemory), 8);
    }
}
