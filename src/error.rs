use thiserror::Error;
use crate::ids::{FabricAddr, TransferId};

/// Generic error codes in errno style, as reported by the fabric and passed on to the
///  application.
pub mod errno {
    pub const EIO: i32 = 5;
    pub const EINVAL: i32 = 22;
    pub const EMSGSIZE: i32 = 90;
    pub const EOPNOTSUPP: i32 = 95;
    pub const EADDRNOTAVAIL: i32 = 99;
    pub const ENOBUFS: i32 = 105;
    pub const ETIMEDOUT: i32 = 110;
    pub const EHOSTUNREACH: i32 = 113;
    pub const ECANCELED: i32 = 125;
}

/// Transport specific error codes, carried alongside the generic code for diagnostics.
pub mod prov_errno {
    pub const NONE: i32 = 0;
    /// The receiver had no buffer posted for the packet. This is a remote resource shortage
    ///  and is retried after a backoff rather than reported.
    pub const RNR: i32 = 13;
    pub const UNKNOWN_ADDRESS: i32 = 4096;
    pub const CHECKSUM: i32 = 4097;
    pub const UNREACHABLE: i32 = 4098;
    pub const TRUNCATED: i32 = 4099;
    pub const MALFORMED: i32 = 4100;
}

/// What the fabric reports when a packet can not be handed over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FabricError {
    #[error("transport send queue is full")]
    Again,
    #[error("transport error {err} (provider errno {prov_errno})")]
    Fatal { err: i32, prov_errno: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RdmError {
    /// Out of packet entries or transport send slots. This never reaches the application -
    ///  the queuing path absorbs it.
    #[error("out of transport resources")]
    Again,
    #[error("transport error {err} (provider errno {prov_errno})")]
    Transport { err: i32, prov_errno: i32 },
    #[error("handshake with peer {0} timed out")]
    HandshakeTimeout(FabricAddr),
    #[error("control packet queue for peer {0} is full")]
    CtrlQueueOverflow(FabricAddr),
    #[error("peer {0} does not support {1}")]
    Unsupported(FabricAddr, &'static str),
    #[error("peer {0} was removed")]
    PeerRemoved(FabricAddr),
    #[error("message of {len} bytes exceeds the maximum of {max} bytes")]
    MessageTooLong { len: usize, max: usize },
    #[error("no transfer entry {0}")]
    UnknownTransfer(TransferId),
    #[error("malformed packet from peer {0}")]
    MalformedPacket(FabricAddr),
    #[error("too many incomplete messages from peer {0}")]
    TooManyOpenMessages(FabricAddr),
}

impl RdmError {
    /// the generic (errno style) code for this error
    pub fn err(&self) -> i32 {
        match self {
            RdmError::Again => errno::ENOBUFS,
            RdmError::Transport { err, .. } => *err,
            RdmError::HandshakeTimeout(_) => errno::ETIMEDOUT,
            RdmError::CtrlQueueOverflow(_) => errno::ENOBUFS,
            RdmError::Unsupported(_, _) => errno::EOPNOTSUPP,
            RdmError::PeerRemoved(_) => errno::ECANCELED,
            RdmError::MessageTooLong { .. } => errno::EMSGSIZE,
            RdmError::UnknownTransfer(_) => errno::EINVAL,
            RdmError::MalformedPacket(_) => errno::EIO,
            RdmError::TooManyOpenMessages(_) => errno::ENOBUFS,
        }
    }

    pub fn prov_errno(&self) -> i32 {
        match self {
            RdmError::Transport { prov_errno, .. } => *prov_errno,
            RdmError::MalformedPacket(_) => prov_errno::MALFORMED,
            _ => prov_errno::NONE,
        }
    }
}

impl From<FabricError> for RdmError {
    fn from(value: FabricError) -> Self {
        match value {
            FabricError::Again => RdmError::Again,
            FabricError::Fatal { err, prov_errno } => RdmError::Transport { err, prov_errno },
        }
    }
}

pub type RdmResult<T> = Result<T, RdmError>;
