use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::error::RdmError;
use crate::ids::{FabricAddr, TransferId};

/// The higher-level messaging path. Every transfer gets exactly one terminal notification:
///  either its completion or its error.
#[cfg_attr(test, automock)]
pub trait CompletionSink: Send + Sync + 'static {
    fn on_send_complete(&self, tx: TransferId);

    fn on_send_error(&self, tx: TransferId, err: RdmError);

    fn on_recv_complete(&self, rx: TransferId, from: FabricAddr, msg: Bytes);

    fn on_recv_error(&self, rx: TransferId, err: RdmError);

    /// errors that do not belong to a transfer, e.g. a handshake response that could not be
    ///  sent or a corrupt packet from an unknown message
    fn on_endpoint_error(&self, peer: Option<FabricAddr>, err: RdmError);
}
