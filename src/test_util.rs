//! Helpers for testing code that uses an [Endpoint]: an in-memory fabric whose behavior tests
//!  can control, and a [CompletionSink] that records what it is told.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;
use crate::completion_sink::CompletionSink;
use crate::config::RdmConfig;
use crate::end_point::Endpoint;
use crate::error::{errno, prov_errno, FabricError, RdmError};
use crate::fabric::{Completion, Fabric, LowerPath, SendFlags};
use crate::ids::{FabricAddr, PacketEntryId, TransferId};
use crate::packet_header::{PacketHeader, PacketType, PeerFeatures};

/// A packet that a [SimFabric] accepted from its endpoint
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SimSubmission {
    pub to: FabricAddr,
    pub lower: LowerPath,
    pub inject: bool,
    pub packet: Bytes,
}

impl SimSubmission {
    pub fn packet_type(&self) -> Option<PacketType> {
        self.packet.first()
            .and_then(|&raw| PacketType::try_from(raw).ok())
    }

    pub fn header(&self) -> Option<PacketHeader> {
        let mut buf = self.packet.as_ref();
        PacketHeader::deser(&mut buf).ok()
    }
}

#[derive(Default)]
struct SimNode {
    local_peers: FxHashSet<FabricAddr>,
    posted_recvs: FxHashMap<LowerPath, VecDeque<PacketEntryId>>,
    completions: VecDeque<Completion>,

    send_capacity: Option<usize>,
    num_in_flight: usize,
    num_rejected_sends: usize,
    next_post_error: Option<FabricError>,
    send_completion_errors: VecDeque<(i32, i32)>,
    hold_send_completions: bool,
    /// slots stay in place when a held completion is released, so indexes remain stable
    held_send_completions: Vec<Option<Completion>>,

    submissions: Vec<SimSubmission>,
}

#[derive(Default)]
struct SimState {
    nodes: FxHashMap<FabricAddr, SimNode>,
}

impl SimState {
    fn node(&mut self, addr: FabricAddr) -> &mut SimNode {
        self.nodes.get_mut(&addr)
            .unwrap_or_else(|| panic!("{} is not part of the simulated network", addr))
    }

    /// applies the send restrictions tests configured for a node
    fn check_post(&mut self, from: FabricAddr, to: FabricAddr) -> Result<(), FabricError> {
        let node = self.node(from);
        if let Some(err) = node.next_post_error.take() {
            return Err(err);
        }
        if node.num_rejected_sends > 0 {
            node.num_rejected_sends -= 1;
            return Err(FabricError::Again);
        }
        if let Some(capacity) = node.send_capacity {
            if node.num_in_flight >= capacity {
                return Err(FabricError::Again);
            }
        }
        if !self.nodes.contains_key(&to) {
            return Err(FabricError::Fatal { err: errno::EHOSTUNREACH, prov_errno: prov_errno::UNREACHABLE });
        }
        Ok(())
    }

    /// Places a packet into a receive buffer posted by `to`, returning false if there is none
    fn deliver(&mut self, from: FabricAddr, to: FabricAddr, lower: LowerPath, packet: &[u8]) -> bool {
        let Some(dest) = self.nodes.get_mut(&to) else {
            return false;
        };
        let Some(ctx) = dest.posted_recvs.entry(lower).or_default().pop_front() else {
            return false;
        };
        dest.completions.push_back(Completion::Recv { ctx, lower, src: from, data: Bytes::copy_from_slice(packet) });
        true
    }
}

/// An in-memory network of [SimFabric]s. Packets are delivered synchronously into the
///  receiver's posted buffers, and a packet arriving while the receiver has none posted fails
///  with RNR - the same as a real transport without receiver side buffering.
///
/// All knobs are per node and apply to the node's outgoing packets.
#[derive(Clone, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    pub fn new() -> SimNetwork {
        SimNetwork::default()
    }

    pub fn add_node(&self, addr: FabricAddr) -> SimFabric {
        self.state.lock().unwrap()
            .nodes.insert(addr, SimNode::default());
        SimFabric {
            addr,
            state: self.state.clone(),
        }
    }

    /// marks two nodes as running on the same host, so they can use shared memory
    pub fn set_local(&self, a: FabricAddr, b: FabricAddr) {
        let mut state = self.state.lock().unwrap();
        state.node(a).local_peers.insert(b);
        state.node(b).local_peers.insert(a);
    }

    /// limits the number of sends a node can have in flight, i.e. without their completion
    ///  being polled
    pub fn set_send_capacity(&self, node: FabricAddr, capacity: Option<usize>) {
        self.state.lock().unwrap().node(node).send_capacity = capacity;
    }

    /// the next `n` sends or injects from the node fail with [FabricError::Again]
    pub fn reject_next_sends(&self, node: FabricAddr, n: usize) {
        self.state.lock().unwrap().node(node).num_rejected_sends = n;
    }

    /// the next send or inject from the node fails synchronously with `err`
    pub fn fail_next_post(&self, node: FabricAddr, err: FabricError) {
        self.state.lock().unwrap().node(node).next_post_error = Some(err);
    }

    /// the next `n` sends from the node are accepted, but complete with an error and are not
    ///  delivered
    pub fn fail_next_send_completions(&self, node: FabricAddr, n: usize, err: i32, prov_errno: i32) {
        let mut state = self.state.lock().unwrap();
        let node = state.node(node);
        for _ in 0..n {
            node.send_completion_errors.push_back((err, prov_errno));
        }
    }

    /// While holding, send completions are kept back until they are released explicitly, in
    ///  any order. The packets themselves are delivered right away.
    pub fn hold_send_completions(&self, node: FabricAddr, hold: bool) {
        self.state.lock().unwrap().node(node).hold_send_completions = hold;
    }

    pub fn num_held_send_completions(&self, node: FabricAddr) -> usize {
        self.state.lock().unwrap().node(node)
            .held_send_completions.iter()
            .filter(|c| c.is_some())
            .count()
    }

    /// Releases the `index`-th held send completion, counting from the first send that was
    ///  held
    pub fn release_held_send_completion(&self, node: FabricAddr, index: usize) {
        let mut state = self.state.lock().unwrap();
        let node = state.node(node);
        let completion = node.held_send_completions[index].take()
            .expect("held send completion was released already");
        node.completions.push_back(completion);
    }

    /// Like [SimNetwork::release_held_send_completion], but the send completes with an error
    pub fn fail_held_send_completion(&self, node: FabricAddr, index: usize, err: i32, prov_errno: i32) {
        let mut state = self.state.lock().unwrap();
        let node = state.node(node);
        let completion = node.held_send_completions[index].take()
            .expect("held send completion was released already");
        node.completions.push_back(Completion::SendError { ctx: completion.ctx(), err, prov_errno });
    }

    /// everything the node's endpoint handed to the fabric, in order
    pub fn submissions(&self, node: FabricAddr) -> Vec<SimSubmission> {
        self.state.lock().unwrap().node(node).submissions.clone()
    }

    pub fn num_posted_recvs(&self, node: FabricAddr, lower: LowerPath) -> usize {
        self.state.lock().unwrap().node(node)
            .posted_recvs.get(&lower)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Delivers a raw packet to `to` as if `from` had sent it. Returns false if `to` has no
    ///  receive buffer posted.
    pub fn deliver_raw(&self, from: FabricAddr, to: FabricAddr, lower: LowerPath, packet: &[u8]) -> bool {
        self.state.lock().unwrap().deliver(from, to, lower, packet)
    }

    /// completes one of `to`'s posted receive buffers with an error
    pub fn deliver_recv_error(&self, to: FabricAddr, lower: LowerPath, src: Option<FabricAddr>, err: i32, prov_errno: i32) -> bool {
        let mut state = self.state.lock().unwrap();
        let node = state.node(to);
        let Some(ctx) = node.posted_recvs.entry(lower).or_default().pop_front() else {
            return false;
        };
        node.completions.push_back(Completion::RecvError { ctx, lower, src, err, prov_errno });
        true
    }
}

pub struct SimFabric {
    addr: FabricAddr,
    state: Arc<Mutex<SimState>>,
}

impl Fabric for SimFabric {
    fn is_local(&self, addr: FabricAddr) -> bool {
        self.state.lock().unwrap().node(self.addr).local_peers.contains(&addr)
    }

    fn post_recv(&mut self, lower: LowerPath, ctx: PacketEntryId) -> Result<(), FabricError> {
        self.state.lock().unwrap().node(self.addr)
            .posted_recvs.entry(lower).or_default()
            .push_back(ctx);
        Ok(())
    }

    fn post_send(&mut self, lower: LowerPath, to: FabricAddr, ctx: PacketEntryId, packet_buf: &[u8], _flags: SendFlags) -> Result<(), FabricError> {
        let mut state = self.state.lock().unwrap();
        state.check_post(self.addr, to)?;

        let completion = match state.node(self.addr).send_completion_errors.pop_front() {
            Some((err, prov_errno)) => Completion::SendError { ctx, err, prov_errno },
            None => {
                if state.deliver(self.addr, to, lower, packet_buf) {
                    Completion::Send { ctx }
                }
                else {
                    Completion::SendError { ctx, err: errno::EIO, prov_errno: prov_errno::RNR }
                }
            }
        };

        let node = state.node(self.addr);
        node.submissions.push(SimSubmission { to, lower, inject: false, packet: Bytes::copy_from_slice(packet_buf) });
        node.num_in_flight += 1;
        if node.hold_send_completions {
            node.held_send_completions.push(Some(completion));
        }
        else {
            node.completions.push_back(completion);
        }
        Ok(())
    }

    fn inject(&mut self, lower: LowerPath, to: FabricAddr, packet_buf: &[u8]) -> Result<(), FabricError> {
        let mut state = self.state.lock().unwrap();
        state.check_post(self.addr, to)?;

        if !state.deliver(self.addr, to, lower, packet_buf) {
            debug!("no receive buffer at {} for an injected packet - dropped", to);
        }
        state.node(self.addr).submissions.push(SimSubmission { to, lower, inject: true, packet: Bytes::copy_from_slice(packet_buf) });
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<Completion> {
        let mut state = self.state.lock().unwrap();
        let node = state.node(self.addr);
        let completion = node.completions.pop_front()?;
        if matches!(completion, Completion::Send { .. } | Completion::SendError { .. }) {
            node.num_in_flight -= 1;
        }
        Some(completion)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SinkEvent {
    SendComplete(TransferId),
    SendError(TransferId, RdmError),
    RecvComplete(TransferId, FabricAddr, Bytes),
    RecvError(TransferId, RdmError),
    EndpointError(Option<FabricAddr>, RdmError),
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    /// sender and content of every message received so far
    pub fn received_messages(&self) -> Vec<(FabricAddr, Bytes)> {
        self.events.lock().unwrap().iter()
            .filter_map(|e| match e {
                SinkEvent::RecvComplete(_, from, msg) => Some((*from, msg.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: SinkEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl CompletionSink for RecordingSink {
    fn on_send_complete(&self, tx: TransferId) {
        self.record(SinkEvent::SendComplete(tx));
    }

    fn on_send_error(&self, tx: TransferId, err: RdmError) {
        self.record(SinkEvent::SendError(tx, err));
    }

    fn on_recv_complete(&self, rx: TransferId, from: FabricAddr, msg: Bytes) {
        self.record(SinkEvent::RecvComplete(rx, from, msg));
    }

    fn on_recv_error(&self, rx: TransferId, err: RdmError) {
        self.record(SinkEvent::RecvError(rx, err));
    }

    fn on_endpoint_error(&self, peer: Option<FabricAddr>, err: RdmError) {
        self.record(SinkEvent::EndpointError(peer, err));
    }
}

/// small packets and pools, so tests exercise fragmentation and resource shortage with
///  little data
pub fn test_config() -> RdmConfig {
    RdmConfig {
        max_packet_size: 64,
        tx_pool_size: 16,
        rx_pool_size: 8,
        max_queued_ctrl_per_peer: 8,
        handshake_timeout: Duration::from_secs(1),
        idle_poll_interval: Duration::from_millis(1),
        shm_enabled: false,
        rnr_backoff_initial_rounds: 2,
        rnr_backoff_factor_eighths: 16,
        rnr_backoff_max_rounds: 64,
        max_message_size: 4096,
        max_open_rx_per_peer: 4,
        features: PeerFeatures::all(),
    }
}

/// convenience for unit tests: an endpoint on a new node of the simulated network
pub fn sim_endpoint(net: &SimNetwork, addr: FabricAddr, config: RdmConfig) -> (Endpoint, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let endpoint = Endpoint::open(Arc::new(config), Box::new(net.add_node(addr)), sink.clone())
        .expect("endpoint with test config should open");
    (endpoint, sink)
}

/// Drives all endpoints until none of them has anything left to do, or gives up after a
///  generous number of rounds
pub fn progress_until_idle(endpoints: &mut [&mut Endpoint]) {
    for _ in 0..10_000 {
        let mut num_events = 0;
        for endpoint in endpoints.iter_mut() {
            num_events += endpoint.progress();
        }
        if num_events == 0 && endpoints.iter().all(|e| !e.has_pending_work()) {
            return;
        }
    }
}
