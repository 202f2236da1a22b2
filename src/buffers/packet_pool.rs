use bytes::BytesMut;
use tracing::{debug, trace};
use crate::fabric::LowerPath;
use crate::ids::{FabricAddr, PacketEntryId};
use crate::packet_header::PacketType;
use crate::transfer::XEntry;

/// The single place that holds a packet entry at any time. Every change of owner goes through
///  [PacketPool::move_to] which checks the previous owner, so an entry can never be held in
///  two places.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketOwner {
    Free,
    /// allocated and being filled by the code that allocated it
    Local,
    /// waiting in a peer's RNR resend queue
    Queued,
    /// handed to the fabric: a send waiting for its completion, or a posted receive buffer
    InFlight,
    /// the fabric reported a completion that is queued for processing
    CompletionPending,
}

pub struct PacketEntry {
    id: PacketEntryId,
    buf: BytesMut,
    owner: PacketOwner,
    pub x_entry: Option<XEntry>,
    pub addr: Option<FabricAddr>,
    /// generation of the peer a sent packet is addressed to
    pub peer_generation: u64,
    pub lower: LowerPath,
    /// number of message bytes in a data packet
    pub data_len: usize,
}

impl PacketEntry {
    pub fn id(&self) -> PacketEntryId {
        self.id
    }

    pub fn owner(&self) -> PacketOwner {
        self.owner
    }

    pub fn buf(&self) -> &[u8] {
        self.buf.as_ref()
    }

    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        self.buf.first()
            .and_then(|&raw| PacketType::try_from(raw).ok())
    }

    /// clears the packet's content for reuse as a receive buffer on the same lower path
    pub(crate) fn recycle(&mut self) {
        self.buf.clear();
        self.x_entry = None;
        self.addr = None;
        self.peer_generation = 0;
        self.data_len = 0;
    }

    fn reset(&mut self) {
        self.recycle();
        self.lower = LowerPath::Fabric;
    }
}

/// An arena of fixed-size packet buffers. All buffers are allocated up front and handed out
///  as [PacketEntryId]s; running out of them is reported to the caller rather than growing the
///  pool.
pub struct PacketPool {
    buf_size: usize,
    entries: Vec<PacketEntry>,
    free_list: Vec<PacketEntryId>,
}

impl PacketPool {
    pub fn new(buf_size: usize, capacity: usize) -> PacketPool {
        let entries = (0..capacity)
            .map(|i| PacketEntry {
                id: PacketEntryId::from_raw(i.try_into().expect("packet pool size exceeds u32")),
                buf: BytesMut::with_capacity(buf_size),
                owner: PacketOwner::Free,
                x_entry: None,
                addr: None,
                peer_generation: 0,
                lower: LowerPath::Fabric,
                data_len: 0,
            })
            .collect::<Vec<_>>();

        // reversed so that low ids are handed out first, which makes traces easier to follow
        let free_list = entries.iter()
            .rev()
            .map(|e| e.id)
            .collect();

        PacketPool {
            buf_size,
            entries,
            free_list,
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn alloc(&mut self) -> Option<PacketEntryId> {
        match self.free_list.pop() {
            Some(id) => {
                let entry = &mut self.entries[id.index()];
                debug_assert_eq!(entry.owner, PacketOwner::Free);
                entry.owner = PacketOwner::Local;
                trace!("allocated {}", id);
                Some(id)
            }
            None => {
                debug!("packet pool exhausted");
                None
            }
        }
    }

    pub fn release(&mut self, id: PacketEntryId) {
        let entry = &mut self.entries[id.index()];
        assert_ne!(entry.owner, PacketOwner::Free, "this is a bug: {} released twice", id);

        entry.reset();
        entry.owner = PacketOwner::Free;
        self.free_list.push(id);
        trace!("released {}", id);
    }

    /// Transfers ownership of a packet entry. Panics if the entry is not currently held by
    ///  `from`, since that means two parts of the endpoint think they own it.
    pub fn move_to(&mut self, id: PacketEntryId, from: PacketOwner, to: PacketOwner) {
        let entry = &mut self.entries[id.index()];
        assert_eq!(entry.owner, from, "this is a bug: {} is not owned by {:?}", id, from);
        assert_ne!(to, PacketOwner::Free, "use release() to return {} to the pool", id);
        entry.owner = to;
    }

    pub fn is_owned_by(&self, id: PacketEntryId, owner: PacketOwner) -> bool {
        self.entries.get(id.index())
            .map(|e| e.owner == owner)
            .unwrap_or(false)
    }

    pub fn entry(&self, id: PacketEntryId) -> &PacketEntry {
        &self.entries[id.index()]
    }

    pub fn entry_mut(&mut self, id: PacketEntryId) -> &mut PacketEntry {
        &mut self.entries[id.index()]
    }

    /// number of entries per owner, for diagnostics and tests
    pub fn count_owned_by(&self, owner: PacketOwner) -> usize {
        self.entries.iter()
            .filter(|e| e.owner == owner)
            .count()
    }
}
