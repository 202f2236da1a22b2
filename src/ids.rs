use std::fmt::{Display, Formatter};

/// A resolved peer address, i.e. a handle into the fabric's address vector. The fabric maps it
///  to whatever its native addressing is.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FabricAddr(u64);

impl Display for FabricAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl FabricAddr {
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

/// Identifies a transfer entry in its endpoint. A tx transfer's id doubles as the message id on
///  the wire, so the receiver can refer back to it (e.g. in a receipt).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TransferId(u32);

impl Display for TransferId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "x{}", self.0)
    }
}

impl TransferId {
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// ids wrap around - a transfer living through 2^32 others is not a realistic scenario
    pub fn next(&self) -> TransferId {
        TransferId(self.0.wrapping_add(1))
    }
}

/// Handle of a packet entry in the endpoint's [crate::buffers::packet_pool::PacketPool]. It is
///  also the context that is passed to the fabric and comes back with the completion.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PacketEntryId(u32);

impl Display for PacketEntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "pkt#{}", self.0)
    }
}

impl PacketEntryId {
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}
