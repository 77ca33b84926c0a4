mod registry;
mod service;

pub use registry::{PerformPhase, SendStatus, TransporterRegistry};
pub use signet_buffers as buffers;
pub use signet_transport as transport;
pub use signet_transport::{
    Authenticator, Backend, ChallengeResponseAuth, DmaAdapter, FramingConfig, Link, RdmaConfig,
    RdmaTransporter, Resequenced, Resequencer, SegmentAdapter, ShmConfig, TcpConfig,
    TransporterCallback, TransporterKind,
};
pub use signet_wire as wire;
pub use signet_wire::{
    DeliveryOutcome, IoState, LinearSections, NodeId, SectionSource, SignalHeader, SignalSink,
    TransporterError,
};
pub use tracing;
