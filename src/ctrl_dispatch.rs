//! Posting of control packets (handshakes and receipts), and the queues for everything that
//!  could not be posted right away for lack of resources.
//!
//! Control packets to one peer go out in the order they were requested: once a peer has a
//!  queued control packet, new requests for it are queued behind it without trying to post
//!  them first.

use tracing::{debug, trace, warn};
use crate::buffers::packet_pool::PacketOwner;
use crate::end_point::Endpoint;
use crate::error::{prov_errno, FabricError, RdmError, RdmResult};
use crate::exponential_backoff::ExponentialBackoff;
use crate::fabric::SendFlags;
use crate::ids::FabricAddr;
use crate::packet_header::{PacketHeader, PacketType};
use crate::peer::QueuedCtrl;
use crate::transfer::XEntry;

impl Endpoint {
    /// The peer a control packet for `x_entry` goes to
    pub(crate) fn x_entry_peer(&self, x_entry: XEntry) -> RdmResult<FabricAddr> {
        match x_entry {
            XEntry::Peer(addr) => Ok(addr),
            XEntry::Tx(id) | XEntry::Rx(id) => self.transfers.get(id)
                .map(|t| t.peer)
                .ok_or(RdmError::UnknownTransfer(id)),
        }
    }

    fn init_ctrl_header(&self, x_entry: XEntry, ctrl_type: PacketType) -> RdmResult<PacketHeader> {
        match ctrl_type {
            PacketType::HandshakeRequest => Ok(PacketHeader::HandshakeRequest { features: self.config.features }),
            PacketType::Handshake => Ok(PacketHeader::Handshake { features: self.config.features }),
            PacketType::Receipt => {
                let XEntry::Rx(rx) = x_entry else {
                    panic!("this is a bug: receipt for {:?}, receipts belong to rx entries", x_entry);
                };
                self.transfers.get(rx)
                    .and_then(|t| t.remote_msg_id)
                    .map(|msg_id| PacketHeader::Receipt { msg_id })
                    .ok_or(RdmError::UnknownTransfer(rx))
            }
            PacketType::Eager => panic!("this is a bug: data packets are not posted as control packets"),
        }
    }

    /// Builds a control packet of type `ctrl_type` for `x_entry` and hands it to the fabric.
    ///
    /// Returns [RdmError::Again] if there is no packet entry, the fabric has no room or the
    ///  peer is backing off after RNR. The caller may retry, nothing is retained in that case.
    ///
    /// An injected packet produces no completion, so its entry goes back to the pool before
    ///  this returns. Otherwise the entry is in flight until its completion is processed.
    pub fn post_ctrl(&mut self, x_entry: XEntry, ctrl_type: PacketType, inject: bool, flags: SendFlags) -> RdmResult<()> {
        let addr = self.x_entry_peer(x_entry)?;
        let header = self.init_ctrl_header(x_entry, ctrl_type)?;

        let peer = self.peer_mut(addr);
        if peer.in_backoff() {
            trace!("{} is backing off, not posting {:?}", addr, ctrl_type);
            return Err(RdmError::Again);
        }
        let lower = peer.lower_path();
        let peer_generation = peer.generation();

        let pkt = self.pool.alloc()
            .ok_or(RdmError::Again)?;
        let entry = self.pool.entry_mut(pkt);
        header.ser(entry.buf_mut());
        entry.x_entry = Some(x_entry);
        entry.addr = Some(addr);
        entry.peer_generation = peer_generation;
        entry.lower = lower;

        #[cfg(any(debug_assertions, feature = "packet-dump"))]
        crate::debug::print_packet("post ctrl", self, pkt);

        if inject {
            let result = self.fabric.inject(lower, addr, self.pool.entry(pkt).buf());
            self.pool.release(pkt);
            result?;

            trace!("injected {:?} to {}", ctrl_type, addr);
            if let Some(id) = x_entry.transfer_id() {
                self.release_transfer_if_done(id);
            }
            return Ok(());
        }

        match self.fabric.post_send(lower, addr, pkt, self.pool.entry(pkt).buf(), flags) {
            Ok(()) => {
                self.pool.move_to(pkt, PacketOwner::Local, PacketOwner::InFlight);
                if let Some(t) = x_entry.transfer_id().and_then(|id| self.transfers.get_mut(id)) {
                    t.outstanding_packets += 1;
                }
                self.peer_mut(addr).tx_pending += 1;
                trace!("posted {:?} to {} as {}", ctrl_type, addr, pkt);
                Ok(())
            }
            Err(e) => {
                self.pool.release(pkt);
                Err(e.into())
            }
        }
    }

    /// Like [Endpoint::post_ctrl], but a request that can not be posted for lack of resources
    ///  is queued and posted by a later progress round. Returns an error only if the request
    ///  can never succeed, or if the peer's queue is full.
    pub fn post_ctrl_or_queue(&mut self, x_entry: XEntry, ctrl_type: PacketType, inject: bool) -> RdmResult<()> {
        let addr = self.x_entry_peer(x_entry)?;

        if self.peer_mut(addr).ctrl_queue.is_empty() {
            match self.post_ctrl(x_entry, ctrl_type, inject, SendFlags::empty()) {
                Err(RdmError::Again) => {}
                result => return result,
            }
        }

        self.queue_ctrl(addr, QueuedCtrl { x_entry, ctrl_type, inject })
    }

    fn queue_ctrl(&mut self, addr: FabricAddr, queued: QueuedCtrl) -> RdmResult<()> {
        let max_queued = self.config.max_queued_ctrl_per_peer;

        let peer = self.peer_mut(addr);
        if peer.ctrl_queue.len() >= max_queued {
            warn!("control queue for {} is full, dropping {:?} for {:?}", addr, queued.ctrl_type, queued.x_entry);
            return Err(RdmError::CtrlQueueOverflow(addr));
        }
        peer.ctrl_queue.push_back(queued);
        debug!("queued {:?} for {:?} to {} ({} waiting)", queued.ctrl_type, queued.x_entry, addr, peer.ctrl_queue.len());

        if !self.ctrl_queued_peers.contains(&addr) {
            self.ctrl_queued_peers.push_back(addr);
        }
        if let Some(t) = queued.x_entry.transfer_id().and_then(|id| self.transfers.get_mut(id)) {
            t.queued_ctrl += 1;
        }
        Ok(())
    }

    /// Posts queued control packets, each peer's in order, until resources run out
    pub(crate) fn drain_queued_ctrl(&mut self) -> usize {
        let mut num_posted = 0;
        for _ in 0..self.ctrl_queued_peers.len() {
            let Some(addr) = self.ctrl_queued_peers.pop_front() else {
                break;
            };

            num_posted += self.drain_peer_ctrl_queue(addr);

            if self.peers.get(&addr).map(|p| !p.ctrl_queue.is_empty()).unwrap_or(false) {
                self.ctrl_queued_peers.push_back(addr);
            }
        }
        num_posted
    }

    fn drain_peer_ctrl_queue(&mut self, addr: FabricAddr) -> usize {
        let mut num_posted = 0;
        loop {
            let Some(peer) = self.peers.get(&addr) else {
                break;
            };
            if peer.in_backoff() {
                break;
            }
            let Some(&queued) = peer.ctrl_queue.front() else {
                break;
            };

            if let Some(id) = queued.x_entry.transfer_id() {
                if self.transfers.get(id).map(|t| t.is_failed()).unwrap_or(true) {
                    trace!("dropping queued {:?} for failed transfer {}", queued.ctrl_type, id);
                    self.pop_queued_ctrl(addr, queued);
                    continue;
                }
            }

            match self.post_ctrl(queued.x_entry, queued.ctrl_type, queued.inject, SendFlags::empty()) {
                Ok(()) => {
                    self.pop_queued_ctrl(addr, queued);
                    num_posted += 1;
                }
                Err(RdmError::Again) => break,
                Err(e) => {
                    self.pop_queued_ctrl(addr, queued);
                    self.handle_ctrl_failure(queued.x_entry, queued.ctrl_type, Some(addr), e);
                }
            }
        }
        num_posted
    }

    fn pop_queued_ctrl(&mut self, addr: FabricAddr, queued: QueuedCtrl) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.ctrl_queue.pop_front();
        }
        if let Some(id) = queued.x_entry.transfer_id() {
            if let Some(t) = self.transfers.get_mut(id) {
                t.queued_ctrl -= 1;
            }
            self.release_transfer_if_done(id);
        }
    }

    /// A control packet failed for good: the owning transfer fails, or for packets owned by
    ///  the peer itself, the handshake. A transfer that was reported already (e.g. an rx entry
    ///  whose receipt failed) can not take the error, so it goes to the endpoint instead.
    pub(crate) fn handle_ctrl_failure(&mut self, x_entry: XEntry, ctrl_type: PacketType, addr: Option<FabricAddr>, err: RdmError) {
        match x_entry {
            XEntry::Tx(id) | XEntry::Rx(id) => {
                let is_open = self.transfers.get(id)
                    .map(|t| !t.is_terminal())
                    .unwrap_or(false);
                if is_open {
                    self.fail_transfer(id, err);
                }
                else {
                    warn!("{:?} for {} to {:?} failed after the transfer was reported: {}", ctrl_type, id, addr, err);
                    self.sink.on_endpoint_error(addr, err);
                    self.release_transfer_if_done(id);
                }
            }
            XEntry::Peer(addr) => match ctrl_type {
                PacketType::HandshakeRequest => self.on_handshake_failed(addr, err),
                _ => {
                    warn!("{:?} to {} failed: {}", ctrl_type, addr, err);
                    self.sink.on_endpoint_error(Some(addr), err);
                }
            },
        }
    }

    /// Resends packets that hit RNR, for peers whose backoff allows it in this round
    pub(crate) fn drain_rnr_queues(&mut self) -> usize {
        let backing_off = self.peers.values()
            .filter(|p| p.in_backoff())
            .map(|p| p.addr())
            .collect::<Vec<_>>();

        let mut num_posted = 0;
        for addr in backing_off {
            let config = &self.config;
            let Some(peer) = self.peers.get_mut(&addr) else {
                continue;
            };
            let backoff = peer.backoff.get_or_insert_with(|| ExponentialBackoff::new(config));
            if backoff.should_retry() {
                num_posted += self.resend_rnr_queue(addr);
            }
        }
        num_posted
    }

    fn resend_rnr_queue(&mut self, addr: FabricAddr) -> usize {
        let mut num_posted = 0;
        while let Some(pkt) = self.peers.get(&addr).and_then(|p| p.rnr_queue.front().cloned()) {
            let entry = self.pool.entry(pkt);
            let x_entry = entry.x_entry;
            let lower = entry.lower;

            if let Some(id) = x_entry.and_then(|x| x.transfer_id()) {
                if self.transfers.get(id).map(|t| t.is_failed()).unwrap_or(true) {
                    trace!("dropping RNR resend of {} for failed transfer {}", pkt, id);
                    self.pop_rnr_queue(addr);
                    self.pool.release(pkt);
                    if let Some(t) = self.transfers.get_mut(id) {
                        t.outstanding_packets -= 1;
                    }
                    self.release_transfer_if_done(id);
                    continue;
                }
            }

            match self.fabric.post_send(lower, addr, pkt, self.pool.entry(pkt).buf(), SendFlags::empty()) {
                Ok(()) => {
                    trace!("resent {} to {}", pkt, addr);
                    self.pop_rnr_queue(addr);
                    self.pool.move_to(pkt, PacketOwner::Queued, PacketOwner::InFlight);
                    num_posted += 1;
                }
                Err(FabricError::Again) | Err(FabricError::Fatal { prov_errno: prov_errno::RNR, .. }) => break,
                Err(FabricError::Fatal { err, prov_errno }) => {
                    self.pop_rnr_queue(addr);
                    self.pool.move_to(pkt, PacketOwner::Queued, PacketOwner::CompletionPending);
                    self.handle_send_error(pkt, err, prov_errno);
                }
            }
        }
        num_posted
    }

    fn pop_rnr_queue(&mut self, addr: FabricAddr) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.rnr_queue.pop_front();
        }
    }
}
