use crate::{NodeId, SignalHeader, TransporterError};

/// Per-peer input/output halt state. While input is halted, only signals
/// addressed to the cluster-management block are delivered; while output is
/// halted, `prepare_send` refuses everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum IoState {
    #[default]
    NoHalt,
    HaltInput,
    HaltOutput,
    HaltIO,
}

impl IoState {
    #[inline]
    pub fn input_halted(self) -> bool {
        matches!(self, Self::HaltInput | Self::HaltIO)
    }

    #[inline]
    pub fn output_halted(self) -> bool {
        matches!(self, Self::HaltOutput | Self::HaltIO)
    }
}

/// What the receiver wants after one delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Continue,
    /// Suspend the unpack loop at the next iteration boundary; undelivered
    /// bytes stay buffered for the next `perform_receive`.
    Stop,
}

/// Receiving half of the callback boundary. The unpack loop hands every
/// decoded signal to `deliver_signal`; sections borrow from the receive
/// buffer and are only valid for the duration of the call.
pub trait SignalSink {
    fn deliver_signal(
        &self,
        header: &SignalHeader,
        prio: u8,
        err: Option<TransporterError>,
        data: &[u32],
        sections: &[&[u32]],
    ) -> DeliveryOutcome;

    /// The embedding application may serialize receive processing with its
    /// own state updates. Default is no locking.
    fn lock_transporter(&self, _node: NodeId) {}
    fn unlock_transporter(&self, _node: NodeId) {}
}
