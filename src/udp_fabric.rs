//! A [Fabric] on top of a non-blocking UDP socket. UDP gives the same guarantees as the
//!  unreliable datagram transports the protocol is made for: packets may be dropped, and
//!  nothing is ordered.
//!
//! Every datagram carries a CRC trailer so that corrupt packets are reported as receive errors
//!  rather than parsed. There is no shared memory path: all peers are remote.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use rustc_hash::FxHashMap;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::{debug, error, info, trace};
use crate::error::{errno, prov_errno, FabricError};
use crate::fabric::{Completion, Fabric, LowerPath, SendFlags};
use crate::ids::{FabricAddr, PacketEntryId};

const CHECKSUM_LEN: usize = size_of::<u32>();

fn checksum(packet: &[u8]) -> u32 {
    let hasher = Crc::<u32>::new(&crc::CRC_32_ISCSI);
    hasher.checksum(packet)
}

/// Maps socket addresses to [FabricAddr]s and back. Addresses are assigned in the order they
///  become known, and never reused.
#[derive(Default)]
pub struct AddressVector {
    by_socket_addr: FxHashMap<SocketAddr, FabricAddr>,
    by_fabric_addr: FxHashMap<FabricAddr, SocketAddr>,
    next: u64,
}

impl AddressVector {
    pub fn insert(&mut self, socket_addr: SocketAddr) -> FabricAddr {
        if let Some(addr) = self.by_socket_addr.get(&socket_addr) {
            return *addr;
        }

        let addr = FabricAddr::from_raw(self.next);
        self.next += 1;
        debug!("new address {} for {:?}", addr, socket_addr);
        self.by_socket_addr.insert(socket_addr, addr);
        self.by_fabric_addr.insert(addr, socket_addr);
        addr
    }

    pub fn lookup(&self, addr: FabricAddr) -> Option<SocketAddr> {
        self.by_fabric_addr.get(&addr).cloned()
    }

    pub fn reverse_lookup(&self, socket_addr: SocketAddr) -> Option<FabricAddr> {
        self.by_socket_addr.get(&socket_addr).cloned()
    }
}

pub struct UdpFabric {
    socket: UdpSocket,
    addresses: AddressVector,
    posted_recvs: VecDeque<PacketEntryId>,
    completions: VecDeque<Completion>,
    recv_buf: Vec<u8>,
}

impl UdpFabric {
    pub async fn bind(addr: impl ToSocketAddrs, max_packet_size: usize) -> anyhow::Result<UdpFabric> {
        let socket = UdpSocket::bind(addr).await?;
        info!("bound UDP fabric to {:?}", socket.local_addr()?);

        Ok(UdpFabric {
            socket,
            addresses: AddressVector::default(),
            posted_recvs: VecDeque::new(),
            completions: VecDeque::new(),
            // room for one more byte so that oversized datagrams are detected
            recv_buf: vec![0; max_packet_size + CHECKSUM_LEN + 1],
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Makes a peer known, returning the address to use for it. Peers that send to this
    ///  fabric become known automatically.
    pub fn insert_address(&mut self, socket_addr: SocketAddr) -> FabricAddr {
        self.addresses.insert(socket_addr)
    }

    pub fn addresses(&self) -> &AddressVector {
        &self.addresses
    }

    fn resolve(&self, addr: FabricAddr) -> Result<SocketAddr, FabricError> {
        self.addresses.lookup(addr)
            .ok_or(FabricError::Fatal { err: errno::EADDRNOTAVAIL, prov_errno: prov_errno::UNKNOWN_ADDRESS })
    }

    fn check_lower(lower: LowerPath) -> Result<(), FabricError> {
        match lower {
            LowerPath::Fabric => Ok(()),
            LowerPath::SharedMemory => Err(FabricError::Fatal { err: errno::EOPNOTSUPP, prov_errno: prov_errno::NONE }),
        }
    }

    fn send_datagram(&self, to: SocketAddr, packet_buf: &[u8]) -> Result<(), FabricError> {
        let mut datagram = BytesMut::with_capacity(packet_buf.len() + CHECKSUM_LEN);
        datagram.put_slice(packet_buf);
        datagram.put_u32(checksum(packet_buf));

        match self.socket.try_send_to(&datagram, to) {
            Ok(_) => {
                trace!("sent {} bytes to {:?}", datagram.len(), to);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(FabricError::Again),
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                Err(FabricError::Fatal { err: errno::EIO, prov_errno: e.raw_os_error().unwrap_or(prov_errno::NONE) })
            }
        }
    }

    /// Reads a datagram into the next posted receive buffer. Datagrams stay in the socket
    ///  while no buffer is posted.
    fn try_receive(&mut self) -> Option<Completion> {
        if self.posted_recvs.is_empty() {
            return None;
        }

        let (num_read, from) = match self.socket.try_recv_from(&mut self.recv_buf) {
            Ok(x) => x,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
            Err(e) => {
                error!("socket error: {}", e);
                return None;
            }
        };
        let src = self.addresses.insert(from);
        let ctx = self.posted_recvs.pop_front()?;

        let lower = LowerPath::Fabric;
        if num_read < CHECKSUM_LEN || num_read == self.recv_buf.len() {
            debug!("datagram from {:?} with {} bytes does not fit a packet", from, num_read);
            return Some(Completion::RecvError { ctx, lower, src: Some(src), err: errno::EMSGSIZE, prov_errno: prov_errno::TRUNCATED });
        }

        let (packet, mut trailer) = self.recv_buf[..num_read].split_at(num_read - CHECKSUM_LEN);
        if trailer.get_u32() != checksum(packet) {
            debug!("checksum mismatch in datagram from {:?}", from);
            return Some(Completion::RecvError { ctx, lower, src: Some(src), err: errno::EIO, prov_errno: prov_errno::CHECKSUM });
        }

        trace!("received {} bytes from {:?}", packet.len(), from);
        Some(Completion::Recv { ctx, lower, src, data: Bytes::copy_from_slice(packet) })
    }
}

impl Fabric for UdpFabric {
    fn is_local(&self, _addr: FabricAddr) -> bool {
        false
    }

    fn post_recv(&mut self, lower: LowerPath, ctx: PacketEntryId) -> Result<(), FabricError> {
        Self::check_lower(lower)?;
        self.posted_recvs.push_back(ctx);
        Ok(())
    }

    fn post_send(&mut self, lower: LowerPath, to: FabricAddr, ctx: PacketEntryId, packet_buf: &[u8], _flags: SendFlags) -> Result<(), FabricError> {
        Self::check_lower(lower)?;
        let to = self.resolve(to)?;
        self.send_datagram(to, packet_buf)?;
        self.completions.push_back(Completion::Send { ctx });
        Ok(())
    }

    fn inject(&mut self, lower: LowerPath, to: FabricAddr, packet_buf: &[u8]) -> Result<(), FabricError> {
        Self::check_lower(lower)?;
        let to = self.resolve(to)?;
        self.send_datagram(to, packet_buf)
    }

    fn poll_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
            .or_else(|| self.try_receive())
    }
}
