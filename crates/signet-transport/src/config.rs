use serde::{Deserialize, Serialize};
use signet_wire::MAX_MESSAGE_SIZE;

/// Framing options negotiated per peer, shared by all backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FramingConfig {
    pub signal_id_used: bool,
    pub checksum_used: bool,
    /// Sends/receives between two stats callbacks.
    pub report_freq: u32,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self { signal_id_used: true, checksum_used: false, report_freq: 4096 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TcpConfig {
    pub framing: FramingConfig,
    /// Per-peer aggregation buffer for outgoing framed signals.
    pub send_buffer_size: u32,
    /// Upper bound on one receive chunk; also sizes the staging buffer.
    pub max_receive_size: u32,
    pub sock_snd_buf: u32,
    pub sock_rcv_buf: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            framing: FramingConfig::default(),
            send_buffer_size: 256 * 1024,
            max_receive_size: 64 * 1024,
            sock_snd_buf: 71540,
            sock_rcv_buf: 70080,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShmConfig {
    pub framing: FramingConfig,
    /// SysV key for the segment shared by this node pair.
    pub shm_key: i32,
    /// Whole-segment size; two control pages and two rings must fit, and
    /// each ring must exceed its slack of one maximum message.
    pub shm_size: u32,
    /// Microseconds the reader polls the rings before declaring itself
    /// asleep and arming the wake byte.
    pub spintime_us: u32,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            framing: FramingConfig::default(),
            shm_key: 0,
            shm_size: 16 * MAX_MESSAGE_SIZE,
            spintime_us: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaConfig {
    pub framing: FramingConfig,
    /// Coalescing threshold: buffered bytes that trigger a transfer.
    pub packet_size: u32,
    /// Local staging capacity and remote ring size.
    pub buffer_size: u32,
    /// Base name for the mapped segment files of this node pair.
    pub segment_name: String,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            framing: FramingConfig::default(),
            packet_size: 8 * 1024,
            buffer_size: 4 * MAX_MESSAGE_SIZE,
            segment_name: "signet-rdma".to_string(),
        }
    }
}
