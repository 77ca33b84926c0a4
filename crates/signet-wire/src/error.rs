use thiserror::Error;

/// Every failure kind surfaced through `report_error`.
///
/// Framing and sequencing errors flag the peer as bad-data in the registry;
/// the socket is left to the upstream cluster manager to tear down.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TransporterError {
    #[error("invalid message length")]
    InvalidMessageLength,
    #[error("invalid checksum")]
    InvalidChecksum,
    #[error("unsupported byte order")]
    InvalidByteOrder,
    #[error("compressed messages are not supported")]
    CompressedUnsupported,
    #[error("send buffer full, signal delayed")]
    SendBufferFull,
    #[error("send buffer full, signal lost")]
    SignalLostSendBufferFull,
    #[error("receive buffer full")]
    ReceiveBufferFull,
    #[error("resequencer wait stack full")]
    WaitStackFull,
    #[error("sequence id below the expected id")]
    TooSmallSigId,
    #[error("sequence id beyond the wait stack window")]
    TooLargeSigId,
    #[error("error closing socket")]
    ErrorClosingSocket,
    #[error("unable to create shared memory segment")]
    ShmUnableToCreateSegment,
    #[error("unable to attach shared memory segment")]
    ShmUnableToAttachSegment,
    #[error("unable to remove shared memory segment")]
    ShmUnableToRemoveSegment,
    #[error("shared memory peer disconnected")]
    ShmDisconnect,
    #[error("shared memory segment stat failed")]
    ShmIpcStat,
    #[error("permanent shared memory ipc failure")]
    ShmIpcPermanent,
    #[error("remote-dma link error")]
    RdmaLinkError,
    #[error("unable to start remote-dma sequence")]
    RdmaUnableToStartSequence,
    #[error("unable to create remote-dma sequence")]
    RdmaUnableToCreateSequence,
    #[error("unable to remove remote-dma sequence")]
    RdmaUnableToRemoveSequence,
    #[error("unable to unmap remote-dma segment")]
    RdmaUnableToUnmapSegment,
    #[error("unable to disconnect remote-dma segment")]
    RdmaUnableToDisconnectSegment,
    #[error("cannot initialize local remote-dma segment")]
    RdmaCannotInitLocalSegment,
    #[error("cannot map remote remote-dma segment")]
    RdmaCannotMapRemoteSegment,
    #[error("unrecoverable remote-dma transfer error")]
    RdmaUnrecoverableDataTfxError,
    #[error("unable to close remote-dma channel")]
    RdmaUnableToCloseChannel,
}
