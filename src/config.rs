use std::time::Duration;
use anyhow::bail;
use crate::packet_header::{PacketHeader, PeerFeatures};

#[derive(Debug, Clone)]
pub struct RdmConfig {
    /// This is the size of a packet buffer, i.e. the largest packet the endpoint sends or accepts
    ///  including all headers. The fabric must be able to carry packets of this size without
    ///  fragmentation, and all endpoints talking to each other must agree on it.
    pub max_packet_size: usize,

    /// Number of packet entries available for sending. Running out of them is not an error, it
    ///  causes control packets to be queued and data to be posted later.
    pub tx_pool_size: usize,

    /// Number of receive buffers posted on each lower path. A sender whose packet arrives while
    ///  none is posted gets an RNR error and backs off.
    pub rx_pool_size: usize,

    /// Upper bound for the per-peer FIFO of control packets waiting for transport resources.
    ///  A request beyond it fails with [crate::error::RdmError::CtrlQueueOverflow].
    pub max_queued_ctrl_per_peer: usize,

    pub handshake_timeout: Duration,

    /// How long `wait_handshake` sleeps after a progress round that did nothing
    pub idle_poll_interval: Duration,

    /// Send to peers the fabric reports as local on the shared-memory path
    pub shm_enabled: bool,

    /// RNR backoff, counted in progress rounds: the first retry happens after this many
    ///  rounds, ...
    pub rnr_backoff_initial_rounds: usize,
    /// ... the wait grows by this factor (in eighths, i.e. 16 doubles) ...
    pub rnr_backoff_factor_eighths: usize,
    /// ... up to this many rounds.
    pub rnr_backoff_max_rounds: usize,

    pub max_message_size: usize,

    /// Incomplete incoming messages per peer. Packets lost on the way leave their message
    ///  incomplete for good, so this bounds the memory such messages hold. Data starting a new
    ///  message beyond the limit is dropped.
    pub max_open_rx_per_peer: usize,

    /// The features this endpoint advertises in its handshake packets
    pub features: PeerFeatures,
}

impl RdmConfig {
    /// defaults for a fabric with an Ethernet-sized MTU
    pub fn default_config() -> RdmConfig {
        RdmConfig {
            max_packet_size: 1472,
            tx_pool_size: 1024,
            rx_pool_size: 512,
            max_queued_ctrl_per_peer: 256,
            handshake_timeout: Duration::from_secs(5),
            idle_poll_interval: Duration::from_millis(1),
            shm_enabled: true,
            rnr_backoff_initial_rounds: 2,
            rnr_backoff_factor_eighths: 16,
            rnr_backoff_max_rounds: 1024,
            max_message_size: 16*1024*1024,
            max_open_rx_per_peer: 64,
            features: PeerFeatures::all(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size < PacketHeader::MAX_CTRL_HEADER_LEN.max(PacketHeader::MAX_EAGER_HEADER_LEN + 1) {
            bail!("packet size of {} bytes can not hold the protocol headers", self.max_packet_size);
        }
        if self.tx_pool_size == 0 {
            bail!("tx pool must not be empty");
        }
        if self.rx_pool_size == 0 {
            bail!("rx pool must not be empty");
        }
        if self.max_queued_ctrl_per_peer == 0 {
            bail!("control packet queue must have room for at least one packet");
        }
        if self.rnr_backoff_factor_eighths < 8 {
            bail!("RNR backoff must not shrink");
        }
        if self.rnr_backoff_initial_rounds == 0 || self.rnr_backoff_initial_rounds > self.rnr_backoff_max_rounds {
            bail!("RNR backoff initial rounds must be between 1 and the maximum");
        }
        if self.max_open_rx_per_peer == 0 {
            bail!("at least one incoming message per peer must be allowed");
        }
        if self.max_message_size > u32::MAX as usize {
            bail!("messages are limited to {} bytes", u32::MAX);
        }

        Ok(())
    }

    /// number of message bytes that fit into a single data packet
    pub fn max_data_payload(&self) -> usize {
        self.max_packet_size - PacketHeader::MAX_EAGER_HEADER_LEN
    }
}
