//! Packet dumps for tracing the protocol. Compiled into debug builds, and into release builds
//!  with the `packet-dump` feature.

use std::fmt::{Display, Formatter};
use tracing::{enabled, trace, Level};
use crate::buffers::packet_pool::PacketEntry;
use crate::end_point::Endpoint;
use crate::ids::PacketEntryId;
use crate::packet_header::PacketHeader;

/// Human readable rendering of a packet entry: its bookkeeping and the parsed header
pub struct PacketDump<'a>(pub &'a PacketEntry);

impl Display for PacketDump<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let entry = self.0;
        write!(f, "{} [{:?}] {:?}", entry.id(), entry.owner(), entry.lower)?;
        if let Some(addr) = entry.addr {
            write!(f, " peer {}", addr)?;
        }
        if let Some(x_entry) = entry.x_entry {
            write!(f, " for {:?}", x_entry)?;
        }

        let mut parse_buf = entry.buf();
        match PacketHeader::deser(&mut parse_buf) {
            Ok(header) => write!(f, ": {:?} + {} bytes payload", header, parse_buf.len()),
            Err(_) => write!(f, ": unparseable {:02x?}", entry.buf()),
        }
    }
}

/// Logs a packet at trace level, prefixed with what is happening to it
pub fn print_packet(prefix: &str, endpoint: &Endpoint, pkt: PacketEntryId) {
    if enabled!(Level::TRACE) {
        trace!("{}: {}", prefix, PacketDump(endpoint.pool.entry(pkt)));
    }
}
