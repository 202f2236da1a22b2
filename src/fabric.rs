use bitflags::bitflags;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::error::FabricError;
use crate::ids::{FabricAddr, PacketEntryId};

/// The lower transport paths a packet can travel on. Peers on the same host can be reached
///  through shared memory, all others (and local ones if shared memory is disabled) through
///  the fabric itself.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LowerPath {
    Fabric,
    SharedMemory,
}

impl LowerPath {
    pub const ALL: [LowerPath; 2] = [LowerPath::Fabric, LowerPath::SharedMemory];
}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct SendFlags: u32 {
        /// hint that more sends follow immediately, so the fabric may batch them
        const MORE = 0b0000_0001;
    }
}

/// An event reported asynchronously by the fabric. `ctx` is the packet entry that was handed
///  to the fabric with the send or the posted receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Send { ctx: PacketEntryId },
    SendError { ctx: PacketEntryId, err: i32, prov_errno: i32 },
    Recv { ctx: PacketEntryId, lower: LowerPath, src: FabricAddr, data: Bytes },
    RecvError { ctx: PacketEntryId, lower: LowerPath, src: Option<FabricAddr>, err: i32, prov_errno: i32 },
}

impl Completion {
    pub fn ctx(&self) -> PacketEntryId {
        match self {
            Completion::Send { ctx } => *ctx,
            Completion::SendError { ctx, .. } => *ctx,
            Completion::Recv { ctx, .. } => *ctx,
            Completion::RecvError { ctx, .. } => *ctx,
        }
    }
}

/// This is the boundary to the unreliable, connectionless transport. All calls are
///  non-blocking: a transport that can not accept a packet right now returns
///  [FabricError::Again].
#[cfg_attr(test, automock)]
pub trait Fabric: Send {
    /// true if the peer can be reached through shared memory
    fn is_local(&self, addr: FabricAddr) -> bool;

    /// Hands a receive buffer to the transport. It comes back with a `Recv` or `RecvError`
    ///  completion.
    fn post_recv(&mut self, lower: LowerPath, ctx: PacketEntryId) -> Result<(), FabricError>;

    /// Sends a packet; exactly one `Send` or `SendError` completion follows for `ctx`
    fn post_send(&mut self, lower: LowerPath, to: FabricAddr, ctx: PacketEntryId, packet_buf: &[u8], flags: SendFlags) -> Result<(), FabricError>;

    /// Sends a packet inline: the buffer is reusable when this returns, and there is no
    ///  completion
    fn inject(&mut self, lower: LowerPath, to: FabricAddr, packet_buf: &[u8]) -> Result<(), FabricError>;

    fn poll_completion(&mut self) -> Option<Completion>;
}
