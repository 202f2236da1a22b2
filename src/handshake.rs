//! The handshake exchanges feature flags with a peer before any data is sent to it. It is
//!  triggered lazily by the first send to the peer, or explicitly through
//!  [Endpoint::wait_handshake].
//!
//! Either side's packet completes it: a handshake request carries the requester's features,
//!  and the response carries the responder's. So a peer is ready as soon as anything arrives
//!  from it, and a request is always answered.

use tracing::{debug, info, trace, warn};
use crate::end_point::Endpoint;
use crate::error::{RdmError, RdmResult};
use crate::ids::FabricAddr;
use crate::packet_header::{PacketType, PeerFeatures};
use crate::peer::HandshakeState;
use crate::transfer::XEntry;

impl Endpoint {
    /// Starts the handshake with a peer if that did not happen yet. Calling this again, or for
    ///  a peer that is ready, does nothing.
    ///
    /// Returns an error if the handshake failed for good, now or earlier.
    pub fn trigger_handshake(&mut self, addr: FabricAddr) -> RdmResult<()> {
        let peer = self.peer_mut(addr);
        if let Some(err) = &peer.handshake_error {
            return Err(err.clone());
        }
        if !peer.advance_handshake(HandshakeState::HandshakeSent) {
            return Ok(());
        }

        debug!("starting handshake with {}", addr);
        if let Err(e) = self.post_ctrl_or_queue(XEntry::Peer(addr), PacketType::HandshakeRequest, false) {
            self.on_handshake_failed(addr, e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Drives the endpoint until the handshake with `addr` is done, triggering it if
    ///  necessary. Fails with [RdmError::HandshakeTimeout] after the configured handshake
    ///  timeout, or with the transport's error if the handshake packet could not be sent.
    ///
    /// This makes progress on the whole endpoint, not just on this peer.
    pub async fn wait_handshake(&mut self, addr: FabricAddr) -> RdmResult<()> {
        self.trigger_handshake(addr)?;

        let timeout = self.config.handshake_timeout;
        match tokio::time::timeout(timeout, self.progress_until_handshake(addr)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("no handshake with {} after {:?}", addr, timeout);
                Err(RdmError::HandshakeTimeout(addr))
            }
        }
    }

    async fn progress_until_handshake(&mut self, addr: FabricAddr) -> RdmResult<()> {
        loop {
            let peer = self.peer_mut(addr);
            if peer.is_ready() {
                return Ok(());
            }
            if let Some(err) = &peer.handshake_error {
                return Err(err.clone());
            }

            if self.progress() == 0 {
                tokio::time::sleep(self.config.idle_poll_interval).await;
            }
            else {
                tokio::task::yield_now().await;
            }
        }
    }

    pub(crate) fn on_handshake_received(&mut self, addr: FabricAddr, features: PeerFeatures) {
        let peer = self.peer_mut(addr);
        if peer.is_ready() {
            trace!("handshake from {} which is ready already", addr);
            return;
        }

        peer.features = features;
        peer.handshake_error = None;
        peer.advance_handshake(HandshakeState::Ready);
        info!("handshake with {} done, peer features {:?}", addr, features);

        let blocked = std::mem::take(&mut peer.blocked_sends);
        for id in blocked {
            self.start_transfer(id);
        }
    }

    /// The handshake request could not be sent. Sends waiting for the handshake fail, and so
    ///  do all future attempts until the peer is removed.
    pub(crate) fn on_handshake_failed(&mut self, addr: FabricAddr, err: RdmError) {
        let peer = self.peer_mut(addr);
        if peer.is_ready() {
            debug!("handshake request to {} failed, but the peer is ready anyway", addr);
            return;
        }

        warn!("handshake with {} failed: {}", addr, err);
        peer.handshake_error = Some(err.clone());
        let blocked = std::mem::take(&mut peer.blocked_sends);
        for id in blocked {
            self.fail_transfer(id, err.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use crate::end_point::SendOptions;
    use crate::error::{errno, prov_errno, FabricError};
    use crate::fabric::LowerPath;
    use crate::packet_header::PacketHeader;
    use crate::test_util::{progress_until_idle, sim_endpoint, test_config, SimNetwork, SinkEvent};
    use super::*;

    const A: FabricAddr = FabricAddr::from_raw(1);
    const B: FabricAddr = FabricAddr::from_raw(2);

    fn sent_types(net: &SimNetwork, node: FabricAddr) -> Vec<PacketType> {
        net.submissions(node).iter()
            .filter_map(|s| s.packet_type())
            .collect()
    }

    #[test]
    fn test_trigger_twice_sends_one_request() {
        let net = SimNetwork::new();
        let (mut a, _) = sim_endpoint(&net, A, test_config());
        let (_b, _) = sim_endpoint(&net, B, test_config());

        a.trigger_handshake(B).unwrap();
        a.trigger_handshake(B).unwrap();
        a.progress();
        a.trigger_handshake(B).unwrap();

        assert_eq!(a.handshake_state(B), HandshakeState::HandshakeSent);
        assert_eq!(sent_types(&net, A), vec![PacketType::HandshakeRequest]);
    }

    #[test]
    fn test_trigger_under_backpressure_sends_one_request() {
        let net = SimNetwork::new();
        let (mut a, _) = sim_endpoint(&net, A, test_config());
        let (_b, _) = sim_endpoint(&net, B, test_config());

        net.reject_next_sends(A, 1);
        a.trigger_handshake(B).unwrap();
        assert_eq!(a.num_queued_ctrl(B), 1);
        a.trigger_handshake(B).unwrap();
        assert_eq!(a.num_queued_ctrl(B), 1);

        a.progress();
        assert_eq!(sent_types(&net, A), vec![PacketType::HandshakeRequest]);
    }

    #[test]
    fn test_send_waits_for_handshake() {
        let net = SimNetwork::new();
        let (mut a, sink_a) = sim_endpoint(&net, A, test_config());
        let (mut b, sink_b) = sim_endpoint(&net, B, test_config());

        let tx = a.send_msg(B, b"hello", SendOptions::default()).unwrap();
        assert_eq!(a.handshake_state(B), HandshakeState::HandshakeSent);
        assert_eq!(sent_types(&net, A), vec![PacketType::HandshakeRequest]);

        // b learns a's features from the request, and answers it
        b.progress();
        assert_eq!(b.handshake_state(A), HandshakeState::Ready);
        assert_eq!(b.peer_features(A), Some(PeerFeatures::all()));
        assert_eq!(sent_types(&net, B), vec![PacketType::Handshake]);

        a.progress();
        assert_eq!(a.handshake_state(B), HandshakeState::Ready);
        assert_eq!(sent_types(&net, A), vec![PacketType::HandshakeRequest, PacketType::Eager]);

        progress_until_idle(&mut [&mut a, &mut b]);
        assert_eq!(sink_a.events(), vec![SinkEvent::SendComplete(tx)]);
        assert_eq!(sink_b.received_messages()[0].1.as_ref(), b"hello");
    }

    #[test]
    fn test_handshake_state_never_goes_back() {
        let net = SimNetwork::new();
        let (mut a, _) = sim_endpoint(&net, A, test_config());
        let (mut b, _) = sim_endpoint(&net, B, test_config());

        a.trigger_handshake(B).unwrap();
        progress_until_idle(&mut [&mut a, &mut b]);
        assert_eq!(a.handshake_state(B), HandshakeState::Ready);

        let mut packet = Vec::new();
        PacketHeader::Handshake { features: PeerFeatures::empty() }.ser(&mut packet);
        assert!(net.deliver_raw(B, A, LowerPath::Fabric, &packet));
        a.progress();

        assert_eq!(a.handshake_state(B), HandshakeState::Ready);
        assert_eq!(a.peer_features(B), Some(PeerFeatures::all()));

        a.trigger_handshake(B).unwrap();
        assert_eq!(sent_types(&net, A), vec![PacketType::HandshakeRequest]);
    }

    #[test]
    fn test_request_is_answered_when_ready() {
        let net = SimNetwork::new();
        let (mut a, _) = sim_endpoint(&net, A, test_config());
        let (mut b, _) = sim_endpoint(&net, B, test_config());

        a.trigger_handshake(B).unwrap();
        progress_until_idle(&mut [&mut a, &mut b]);

        // e.g. b restarted and sends its request again
        let mut packet = Vec::new();
        PacketHeader::HandshakeRequest { features: PeerFeatures::all() }.ser(&mut packet);
        assert!(net.deliver_raw(B, A, LowerPath::Fabric, &packet));
        a.progress();

        assert_eq!(sent_types(&net, A), vec![PacketType::HandshakeRequest, PacketType::Handshake]);
    }

    #[test]
    fn test_sync_handshake_failure_is_sticky() {
        let net = SimNetwork::new();
        let (mut a, sink_a) = sim_endpoint(&net, A, test_config());
        let expected = RdmError::Transport { err: errno::EHOSTUNREACH, prov_errno: prov_errno::UNREACHABLE };

        net.fail_next_post(A, FabricError::Fatal { err: errno::EHOSTUNREACH, prov_errno: prov_errno::UNREACHABLE });
        assert_eq!(a.send_msg(B, b"x", SendOptions::default()), Err(expected.clone()));
        assert_eq!(a.trigger_handshake(B), Err(expected.clone()));
        assert_eq!(a.send_msg(B, b"x", SendOptions::default()), Err(expected));

        assert!(sink_a.events().is_empty());
        assert_eq!(a.num_transfers(), 0);
    }

    #[test]
    fn test_async_handshake_failure_fails_waiting_sends() {
        let net = SimNetwork::new();
        let (mut a, sink_a) = sim_endpoint(&net, A, test_config());
        let (_b, _) = sim_endpoint(&net, B, test_config());
        let expected = RdmError::Transport { err: errno::EIO, prov_errno: prov_errno::UNREACHABLE };

        net.fail_next_send_completions(A, 1, errno::EIO, prov_errno::UNREACHABLE);
        let tx1 = a.send_msg(B, b"1", SendOptions::default()).unwrap();
        let tx2 = a.send_msg(B, b"2", SendOptions::default()).unwrap();
        a.progress();

        assert_eq!(sink_a.events(), vec![
            SinkEvent::SendError(tx1, expected.clone()),
            SinkEvent::SendError(tx2, expected.clone()),
        ]);
        assert_eq!(a.send_msg(B, b"3", SendOptions::default()), Err(expected));
        assert_eq!(a.num_transfers(), 0);
    }

    #[test]
    fn test_removed_peer_starts_over() {
        let net = SimNetwork::new();
        let (mut a, _) = sim_endpoint(&net, A, test_config());
        let (mut b, _) = sim_endpoint(&net, B, test_config());

        net.fail_next_post(A, FabricError::Fatal { err: errno::EHOSTUNREACH, prov_errno: prov_errno::UNREACHABLE });
        assert!(a.trigger_handshake(B).is_err());

        a.remove_peer(B);
        a.trigger_handshake(B).unwrap();
        progress_until_idle(&mut [&mut a, &mut b]);
        assert_eq!(a.handshake_state(B), HandshakeState::Ready);
    }

    #[test]
    fn test_late_failure_from_removed_peer_does_not_affect_new_peer() {
        let net = SimNetwork::new();
        let (mut a, sink_a) = sim_endpoint(&net, A, test_config());
        let (mut b, _) = sim_endpoint(&net, B, test_config());

        net.hold_send_completions(A, true);
        let tx1 = a.send_msg(B, b"1", SendOptions::default()).unwrap();
        a.remove_peer(B);

        net.hold_send_completions(A, false);
        let tx2 = a.send_msg(B, b"2", SendOptions::default()).unwrap();
        // the first peer's handshake request fails only now
        net.fail_held_send_completion(A, 0, errno::EIO, prov_errno::UNREACHABLE);
        progress_until_idle(&mut [&mut a, &mut b]);

        assert_eq!(a.handshake_state(B), HandshakeState::Ready);
        assert_eq!(sink_a.events(), vec![
            SinkEvent::SendError(tx1, RdmError::PeerRemoved(B)),
            SinkEvent::SendComplete(tx2),
        ]);
        assert_eq!(a.pending_sends(B), 0);
        assert_eq!(a.num_free_packets(), 16);
    }

    #[tokio::test]
    async fn test_wait_handshake() {
        let net = SimNetwork::new();
        let (mut a, _) = sim_endpoint(&net, A, test_config());
        let (mut b, _) = sim_endpoint(&net, B, test_config());

        let drive_b = async {
            loop {
                b.progress();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };

        tokio::select! {
            result = a.wait_handshake(B) => assert_eq!(result, Ok(())),
            _ = drive_b => unreachable!(),
        }
        assert_eq!(a.handshake_state(B), HandshakeState::Ready);

        // ready peers return right away
        assert_eq!(a.wait_handshake(B).await, Ok(()));
    }

    #[tokio::test]
    async fn test_wait_handshake_post_error() {
        let net = SimNetwork::new();
        let (mut a, _) = sim_endpoint(&net, A, test_config());

        net.fail_next_post(A, FabricError::Fatal { err: errno::EHOSTUNREACH, prov_errno: prov_errno::UNREACHABLE });
        assert_eq!(a.wait_handshake(B).await, Err(RdmError::Transport { err: errno::EHOSTUNREACH, prov_errno: prov_errno::UNREACHABLE }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_handshake_completion_error() {
        let net = SimNetwork::new();
        let (mut a, _) = sim_endpoint(&net, A, test_config());
        let (_b, _) = sim_endpoint(&net, B, test_config());

        net.fail_next_send_completions(A, 1, errno::EIO, prov_errno::UNREACHABLE);
        assert_eq!(a.wait_handshake(B).await, Err(RdmError::Transport { err: errno::EIO, prov_errno: prov_errno::UNREACHABLE }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_handshake_timeout() {
        let net = SimNetwork::new();
        let (mut a, _) = sim_endpoint(&net, A, test_config());
        // b never makes progress, so it never answers
        let (_b, _) = sim_endpoint(&net, B, test_config());

        let start = tokio::time::Instant::now();
        assert_eq!(a.wait_handshake(B).await, Err(RdmError::HandshakeTimeout(B)));
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(a.handshake_state(B), HandshakeState::HandshakeSent);
    }
}
