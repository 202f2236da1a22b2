use std::collections::VecDeque;
use tracing::debug;
use crate::error::RdmError;
use crate::exponential_backoff::ExponentialBackoff;
use crate::fabric::LowerPath;
use crate::ids::{FabricAddr, PacketEntryId, TransferId};
use crate::packet_header::{PacketType, PeerFeatures};
use crate::transfer::XEntry;

/// Handshake progress with a peer. The order of the variants is the order of the protocol, and
///  a peer's state only ever moves forward.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum HandshakeState {
    Uninitialized,
    /// we sent (or queued) a handshake request and wait for the peer's features
    HandshakeSent,
    /// the peer's features are known, data may flow
    Ready,
}

/// A control packet that could not be posted for lack of resources
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct QueuedCtrl {
    pub x_entry: XEntry,
    pub ctrl_type: PacketType,
    pub inject: bool,
}

pub struct Peer {
    addr: FabricAddr,
    /// distinguishes this peer from earlier peers with the same address that were removed
    generation: u64,
    handshake: HandshakeState,
    /// set when a handshake packet failed fatally; the peer stays unusable until it is removed
    pub handshake_error: Option<RdmError>,
    pub features: PeerFeatures,
    pub is_local: bool,

    /// control packets waiting for resources, sent in this order
    pub ctrl_queue: VecDeque<QueuedCtrl>,
    /// tx transfers waiting for the handshake
    pub blocked_sends: VecDeque<TransferId>,
    /// packets that hit RNR, resent when the backoff allows
    pub rnr_queue: VecDeque<PacketEntryId>,
    pub backoff: Option<ExponentialBackoff>,

    /// sends handed to the fabric whose completion has not been processed
    pub tx_pending: usize,
}

impl Peer {
    pub fn new(addr: FabricAddr, generation: u64, is_local: bool) -> Peer {
        Peer {
            addr,
            generation,
            handshake: HandshakeState::Uninitialized,
            handshake_error: None,
            features: PeerFeatures::empty(),
            is_local,
            ctrl_queue: VecDeque::new(),
            blocked_sends: VecDeque::new(),
            rnr_queue: VecDeque::new(),
            backoff: None,
            tx_pending: 0,
        }
    }

    pub fn addr(&self) -> FabricAddr {
        self.addr
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake
    }

    pub fn is_ready(&self) -> bool {
        self.handshake == HandshakeState::Ready
    }

    /// Moves the handshake state forward, returning true if it changed. Attempts to move
    ///  backwards are ignored.
    pub fn advance_handshake(&mut self, to: HandshakeState) -> bool {
        if to <= self.handshake {
            return false;
        }
        debug!("peer {}: handshake {:?} -> {:?}", self.addr, self.handshake, to);
        self.handshake = to;
        true
    }

    pub fn lower_path(&self) -> LowerPath {
        if self.is_local {
            LowerPath::SharedMemory
        }
        else {
            LowerPath::Fabric
        }
    }

    /// While a peer has packets waiting for an RNR retry, nothing else is sent to it
    pub fn in_backoff(&self) -> bool {
        !self.rnr_queue.is_empty()
    }
}
