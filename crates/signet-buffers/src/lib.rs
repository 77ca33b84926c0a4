mod mutex;
mod ring;
mod segment;
mod send_buffer;

pub use mutex::SharedMutex;
pub use ring::{RingControl, RingReader, RingWriter};
pub use segment::{SegmentError, SysvSegment};
pub use send_buffer::SendBuffer;
