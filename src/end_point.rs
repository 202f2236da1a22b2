use std::cmp::min;
use std::collections::VecDeque;
use std::sync::Arc;
use bytes::BufMut;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, trace_span, warn};
use uuid::Uuid;
use crate::buffers::packet_pool::{PacketOwner, PacketPool};
use crate::completion_sink::CompletionSink;
use crate::config::RdmConfig;
use crate::error::{errno, prov_errno, FabricError, RdmError, RdmResult};
use crate::fabric::{Completion, Fabric, LowerPath, SendFlags};
use crate::ids::{FabricAddr, PacketEntryId, TransferId};
use crate::packet_header::{EagerHeader, PacketHeader, PeerFeatures};
use crate::peer::{HandshakeState, Peer};
use crate::transfer::{TransferState, TransferTable, XEntry};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct SendOptions {
    /// Complete the send only after the receiver confirmed that the message was placed. This
    ///  requires the peer to support [PeerFeatures::DELIVERY_COMPLETE].
    pub delivery_complete: bool,
}

/// A completion taken from the fabric, waiting to be processed in the progress loop
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum WorkItem {
    SendDone(PacketEntryId),
    SendFailed { pkt: PacketEntryId, err: i32, prov_errno: i32 },
    Received { pkt: PacketEntryId, lower: LowerPath },
    RecvFailed { pkt: PacketEntryId, err: i32, prov_errno: i32 },
}

enum DataPost {
    /// every packet of the transfer is handed to the fabric
    Done(usize),
    /// the peer is backing off, retry in a later round
    Deferred(usize),
    /// out of packet entries or fabric send slots
    Exhausted(usize),
}

/// The endpoint is where all parts of the protocol come together. It owns the peers, the
///  packet pool and the transfer entries, and [Endpoint::progress] drives everything: it polls
///  the fabric's completions, processes them and posts what was waiting for resources.
///
/// All state is owned by the endpoint and mutated only through `&mut self`, i.e. from whatever
///  drives the progress loop.
pub struct Endpoint {
    id: Uuid,
    pub(crate) config: Arc<RdmConfig>,
    pub(crate) fabric: Box<dyn Fabric>,
    pub(crate) sink: Arc<dyn CompletionSink>,
    pub(crate) pool: PacketPool,
    pub(crate) peers: FxHashMap<FabricAddr, Peer>,
    next_peer_generation: u64,
    pub(crate) transfers: TransferTable,
    /// peers with a non-empty control queue
    pub(crate) ctrl_queued_peers: VecDeque<FabricAddr>,
    /// tx transfers with data that is not posted yet
    pub(crate) pending_data: VecDeque<TransferId>,
    pub(crate) work: VecDeque<WorkItem>,
    /// receive buffers that could not be reposted
    pub(crate) rx_repost_deficit: FxHashMap<LowerPath, usize>,
}

impl Endpoint {
    pub fn open(config: Arc<RdmConfig>, fabric: Box<dyn Fabric>, sink: Arc<dyn CompletionSink>) -> anyhow::Result<Endpoint> {
        config.validate()?;

        let lower_paths = if config.shm_enabled {
            LowerPath::ALL.to_vec()
        }
        else {
            vec![LowerPath::Fabric]
        };

        let pool = PacketPool::new(config.max_packet_size, config.tx_pool_size + lower_paths.len() * config.rx_pool_size);
        let mut endpoint = Endpoint {
            id: Uuid::new_v4(),
            config,
            fabric,
            sink,
            pool,
            peers: FxHashMap::default(),
            next_peer_generation: 1,
            transfers: TransferTable::default(),
            ctrl_queued_peers: VecDeque::new(),
            pending_data: VecDeque::new(),
            work: VecDeque::new(),
            rx_repost_deficit: FxHashMap::default(),
        };

        for &lower in &lower_paths {
            for _ in 0..endpoint.config.rx_pool_size {
                endpoint.post_rx_buffer(lower)?;
            }
        }

        info!("opened endpoint {} with {} tx packet entries and {} rx buffers on {:?}",
            endpoint.id, endpoint.config.tx_pool_size, endpoint.config.rx_pool_size, lower_paths);
        Ok(endpoint)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &RdmConfig {
        self.config.as_ref()
    }

    pub fn handshake_state(&self, addr: FabricAddr) -> HandshakeState {
        self.peers.get(&addr)
            .map(|p| p.handshake_state())
            .unwrap_or(HandshakeState::Uninitialized)
    }

    /// The peer's features, known once the handshake is done
    pub fn peer_features(&self, addr: FabricAddr) -> Option<PeerFeatures> {
        self.peers.get(&addr)
            .filter(|p| p.is_ready())
            .map(|p| p.features)
    }

    pub fn num_free_packets(&self) -> usize {
        self.pool.num_free()
    }

    pub fn num_queued_ctrl(&self, addr: FabricAddr) -> usize {
        self.peers.get(&addr)
            .map(|p| p.ctrl_queue.len())
            .unwrap_or(0)
    }

    pub fn num_transfers(&self) -> usize {
        self.transfers.len()
    }

    pub fn pending_sends(&self, addr: FabricAddr) -> usize {
        self.peers.get(&addr)
            .map(|p| p.tx_pending)
            .unwrap_or(0)
    }

    /// true if there is work that a later progress round will pick up even without new
    ///  completions from the fabric
    pub fn has_pending_work(&self) -> bool {
        !self.work.is_empty()
            || !self.pending_data.is_empty()
            || !self.ctrl_queued_peers.is_empty()
            || self.peers.values().any(|p| p.in_backoff())
    }

    /// peers are created on first reference
    pub(crate) fn peer_mut(&mut self, addr: FabricAddr) -> &mut Peer {
        let fabric = &self.fabric;
        let shm_enabled = self.config.shm_enabled;
        let next_generation = &mut self.next_peer_generation;
        self.peers.entry(addr)
            .or_insert_with(|| {
                let is_local = shm_enabled && fabric.is_local(addr);
                let generation = *next_generation;
                *next_generation += 1;
                debug!("new peer {} (generation {}, local: {})", addr, generation, is_local);
                Peer::new(addr, generation, is_local)
            })
    }

    /// The peer a sent packet was addressed to, unless that peer was removed since. A peer
    ///  created later for the same address is a different peer.
    pub(crate) fn sent_to_peer_mut(&mut self, addr: Option<FabricAddr>, generation: u64) -> Option<&mut Peer> {
        addr.and_then(|a| self.peers.get_mut(&a))
            .filter(|p| p.generation() == generation)
    }

    /// Sends a message to a peer, returning the id of its tx entry. The outcome is reported to
    ///  the [CompletionSink] - exactly once, either as completion or as error.
    ///
    /// If the handshake with the peer is not done yet, it is triggered and the message waits
    ///  for it. This returns an error only if the message can never be sent, i.e. it is too
    ///  big or the handshake with the peer failed.
    pub fn send_msg(&mut self, to: FabricAddr, msg: &[u8], options: SendOptions) -> RdmResult<TransferId> {
        if msg.len() > self.config.max_message_size {
            return Err(RdmError::MessageTooLong { len: msg.len(), max: self.config.max_message_size });
        }

        self.trigger_handshake(to)?;

        let id = self.transfers.insert_tx(to, msg, options.delivery_complete);
        let peer = self.peer_mut(to);
        if peer.is_ready() {
            self.start_transfer(id);
        }
        else {
            trace!("{} waits for the handshake with {}", id, to);
            peer.blocked_sends.push_back(id);
        }

        self.drain_pending_data();
        Ok(id)
    }

    /// Moves a tx entry from waiting for the handshake to the data queue
    pub(crate) fn start_transfer(&mut self, id: TransferId) {
        let Some(tx) = self.transfers.get_mut(id) else {
            return;
        };
        if tx.is_terminal() {
            return;
        }

        let peer_features = self.peers.get(&tx.peer)
            .map(|p| p.features)
            .unwrap_or_default();
        if tx.delivery_complete && !peer_features.contains(PeerFeatures::DELIVERY_COMPLETE) {
            let peer = tx.peer;
            self.fail_transfer(id, RdmError::Unsupported(peer, "delivery complete"));
            return;
        }

        tx.state = TransferState::Active;
        self.pending_data.push_back(id);
    }

    /// Removes a peer and everything that refers to it. Transfers with the peer fail with
    ///  [RdmError::PeerRemoved]; packets already handed to the fabric complete normally. The
    ///  next reference to the address creates a fresh peer that starts over with the handshake.
    pub fn remove_peer(&mut self, addr: FabricAddr) {
        let Some(mut peer) = self.peers.remove(&addr) else {
            return;
        };
        info!("removing peer {}", addr);
        if peer.tx_pending > 0 {
            debug!("peer {} removed with {} sends in flight", addr, peer.tx_pending);
        }

        self.ctrl_queued_peers.retain(|a| *a != addr);
        for queued in peer.ctrl_queue.drain(..) {
            if let Some(tx) = queued.x_entry.transfer_id().and_then(|id| self.transfers.get_mut(id)) {
                tx.queued_ctrl -= 1;
            }
        }
        for pkt in peer.rnr_queue.drain(..) {
            let x_entry = self.pool.entry(pkt).x_entry;
            self.pool.release(pkt);
            if let Some(tx) = x_entry.and_then(|x| x.transfer_id()).and_then(|id| self.transfers.get_mut(id)) {
                tx.outstanding_packets -= 1;
            }
        }

        for id in self.transfers.ids_for_peer(addr) {
            self.fail_transfer(id, RdmError::PeerRemoved(addr));
            self.release_transfer_if_done(id);
        }
    }

    /// Does one round of work: processes the fabric's completions and posts whatever waits for
    ///  resources. Returns the number of completions processed and packets posted, so a caller
    ///  can tell an idle round.
    pub fn progress(&mut self) -> usize {
        let span = trace_span!("progress", endpoint = %self.id);
        let _entered = span.enter();

        let mut num_events = self.poll_fabric();
        while let Some(item) = self.work.pop_front() {
            self.handle_work_item(item);
        }

        num_events += self.repost_rx_buffers();
        num_events += self.drain_rnr_queues();
        num_events += self.drain_queued_ctrl();
        num_events += self.drain_pending_data();
        num_events
    }

    /// Takes completions from the fabric, turning them into work items. Receive completions
    ///  get their data placed into the posted packet entry here.
    fn poll_fabric(&mut self) -> usize {
        let buf_size = self.pool.buf_size();

        let mut num_completions = 0;
        while let Some(completion) = self.fabric.poll_completion() {
            let pkt = completion.ctx();
            if !self.pool.is_owned_by(pkt, PacketOwner::InFlight) {
                warn!("completion for {} which is not in flight - ignoring", pkt);
                continue;
            }
            self.pool.move_to(pkt, PacketOwner::InFlight, PacketOwner::CompletionPending);
            num_completions += 1;

            let item = match completion {
                Completion::Send { ctx } => WorkItem::SendDone(ctx),
                Completion::SendError { ctx, err, prov_errno } => WorkItem::SendFailed { pkt: ctx, err, prov_errno },
                Completion::Recv { ctx, lower, src, data } => {
                    let entry = self.pool.entry_mut(ctx);
                    entry.addr = Some(src);
                    entry.lower = lower;
                    if data.len() > buf_size {
                        debug!("received {} bytes from {} into a buffer of {} bytes", data.len(), src, buf_size);
                        WorkItem::RecvFailed { pkt: ctx, err: errno::EMSGSIZE, prov_errno: prov_errno::TRUNCATED }
                    }
                    else {
                        entry.buf_mut().put_slice(&data);
                        WorkItem::Received { pkt: ctx, lower }
                    }
                }
                Completion::RecvError { ctx, lower, src, err, prov_errno } => {
                    let entry = self.pool.entry_mut(ctx);
                    entry.addr = src;
                    entry.lower = lower;
                    WorkItem::RecvFailed { pkt: ctx, err, prov_errno }
                }
            };
            self.work.push_back(item);
        }
        num_completions
    }

    pub(crate) fn post_rx_buffer(&mut self, lower: LowerPath) -> Result<(), FabricError> {
        let Some(pkt) = self.pool.alloc() else {
            return Err(FabricError::Again);
        };
        self.pool.entry_mut(pkt).lower = lower;

        match self.fabric.post_recv(lower, pkt) {
            Ok(()) => {
                self.pool.move_to(pkt, PacketOwner::Local, PacketOwner::InFlight);
                Ok(())
            }
            Err(e) => {
                self.pool.release(pkt);
                Err(e)
            }
        }
    }

    fn repost_rx_buffers(&mut self) -> usize {
        let mut num_posted = 0;
        for lower in LowerPath::ALL {
            while self.rx_repost_deficit.get(&lower).cloned().unwrap_or(0) > 0 {
                if self.post_rx_buffer(lower).is_err() {
                    break;
                }
                if let Some(deficit) = self.rx_repost_deficit.get_mut(&lower) {
                    *deficit -= 1;
                }
                num_posted += 1;
            }
        }
        num_posted
    }

    pub(crate) fn drain_pending_data(&mut self) -> usize {
        let mut num_posted = 0;
        let mut still_pending = VecDeque::new();
        let mut exhausted = false;

        while let Some(id) = self.pending_data.pop_front() {
            if exhausted {
                still_pending.push_back(id);
                continue;
            }

            match self.post_data(id) {
                Ok(DataPost::Done(n)) => num_posted += n,
                Ok(DataPost::Deferred(n)) => {
                    num_posted += n;
                    still_pending.push_back(id);
                }
                Ok(DataPost::Exhausted(n)) => {
                    num_posted += n;
                    exhausted = true;
                    still_pending.push_back(id);
                }
                Err(e) => self.fail_transfer(id, e),
            }
        }

        still_pending.append(&mut self.pending_data);
        self.pending_data = still_pending;
        num_posted
    }

    /// Posts as many of a transfer's data packets as resources allow
    fn post_data(&mut self, id: TransferId) -> RdmResult<DataPost> {
        let max_payload = self.config.max_data_payload();

        let mut num_posted = 0;
        loop {
            let Some(tx) = self.transfers.get(id) else {
                return Ok(DataPost::Done(num_posted));
            };
            if tx.is_terminal() || tx.all_posted() {
                return Ok(DataPost::Done(num_posted));
            }

            let peer_addr = tx.peer;
            let offset = tx.bytes_posted;
            let chunk_len = min(tx.total_len - offset, max_payload);
            let total_len = u32::try_from(tx.total_len)
                .map_err(|_| RdmError::MessageTooLong { len: tx.total_len, max: u32::MAX as usize })?;
            let header = PacketHeader::Eager(EagerHeader {
                msg_id: id,
                delivery_complete: tx.delivery_complete,
                total_len,
                offset: offset as u32, // offset < total_len
            });
            let flags = if offset + chunk_len < tx.total_len { SendFlags::MORE } else { SendFlags::empty() };

            let peer = self.peer_mut(peer_addr);
            assert!(peer.is_ready(), "this is a bug: data for {} before the handshake", peer_addr);
            if peer.in_backoff() {
                return Ok(DataPost::Deferred(num_posted));
            }
            let lower = peer.lower_path();
            let peer_generation = peer.generation();

            let Some(pkt) = self.pool.alloc() else {
                return Ok(DataPost::Exhausted(num_posted));
            };
            if let Some(tx) = self.transfers.get(id) {
                let entry = self.pool.entry_mut(pkt);
                header.ser(entry.buf_mut());
                entry.buf_mut().put_slice(&tx.data[offset..offset + chunk_len]);
                entry.x_entry = Some(XEntry::Tx(id));
                entry.addr = Some(peer_addr);
                entry.peer_generation = peer_generation;
                entry.lower = lower;
                entry.data_len = chunk_len;
            }

            #[cfg(any(debug_assertions, feature = "packet-dump"))]
            crate::debug::print_packet("post data", self, pkt);

            match self.fabric.post_send(lower, peer_addr, pkt, self.pool.entry(pkt).buf(), flags) {
                Ok(()) => {
                    self.pool.move_to(pkt, PacketOwner::Local, PacketOwner::InFlight);
                    if let Some(tx) = self.transfers.get_mut(id) {
                        tx.packets_posted += 1;
                        tx.bytes_posted += chunk_len;
                        tx.outstanding_packets += 1;
                    }
                    self.peer_mut(peer_addr).tx_pending += 1;
                    num_posted += 1;
                }
                Err(FabricError::Again) => {
                    self.pool.release(pkt);
                    return Ok(DataPost::Exhausted(num_posted));
                }
                Err(e) => {
                    self.pool.release(pkt);
                    return Err(e.into());
                }
            }
        }
    }
}
