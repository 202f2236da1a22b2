//! The control plane of a reliable datagram messaging layer on top of an unreliable,
//!  connectionless datagram transport (the *fabric*).
//!
//! Applications send and receive whole messages through an [end_point::Endpoint]. Messages
//!  are split into data packets that fit the transport's packet size, and the endpoint takes
//!  care of everything around the data:
//! * a handshake with every peer before data flows to it, exchanging feature flags
//! * control packets (handshakes and receipts) that are posted, or queued in per-peer FIFO
//!    order while the transport has no room for them
//! * translation of the transport's completions into protocol progress, and a single terminal
//!    notification per message to the [completion_sink::CompletionSink]
//!
//! ## Design goals
//!
//! * Running out of resources is never an error. Packet entries, fabric send slots and
//!    remote receive buffers are all finite, and shortage of any of them delays work rather
//!    than failing it:
//!   * control packets are queued per peer and posted by a later progress round
//!   * data packets are posted as packet entries become available
//!   * packets that the receiver had no buffer for (RNR, "receiver not ready") are resent
//!      after an exponential backoff counted in progress rounds
//! * Every message gets exactly one terminal notification, no matter how many of its packets
//!    fail and in which order completions arrive
//! * Single-threaded and non-blocking: all state belongs to the endpoint, and
//!    [end_point::Endpoint::progress] does one round of work without waiting. Only
//!    [end_point::Endpoint::wait_handshake] is async, driving progress until the handshake is
//!    done or times out.
//! * Peers on the same host can be reached through a shared-memory path, chosen per peer
//!
//! Explicitly *not* in scope are retransmission of dropped packets, ordering between messages
//!  and congestion control.
//!
//! ## Handshake
//!
//! The first send to a peer triggers a HANDSHAKE_REQUEST, which carries the sender's feature
//!  flags. The peer answers with a HANDSHAKE carrying its own. Either packet completes the
//!  handshake on the side receiving it, and data to the peer is held back until then.
//!
//! ## Delivery complete
//!
//! A message can request *delivery complete* semantics: its send completes only after the
//!  receiver placed the whole message and confirmed that with a RECEIPT. This requires the
//!  peer to advertise the feature in its handshake.
//!
//! See [packet_header] for the wire format.

pub mod buffers;
mod completion;
pub mod completion_sink;
pub mod config;
mod ctrl_dispatch;
#[cfg(any(debug_assertions, feature = "packet-dump"))]
pub mod debug;
pub mod end_point;
pub mod error;
pub mod exponential_backoff;
pub mod fabric;
mod handshake;
pub mod ids;
pub mod packet_header;
pub mod peer;
pub mod test_util;
pub mod transfer;
pub mod udp_fabric;
