use tracing::error;

use crate::{
    MAX_RECEIVED_SIGNALS, MAX_RECV_MESSAGE_WORDS, MAX_SECTIONS, QMGR_BLOCK,
    header::{NodeId, SignalHeader, number_to_ref},
    packer::native_byte_order,
    proto::{
        self, PROTOCOL_WORDS, compute_checksum, decode_header, get_checksum_included,
        get_compressed, get_message_length, get_signal_id_included,
    },
    sink::{DeliveryOutcome, IoState, SignalSink},
    TransporterError,
};

/// Result of one `unpack` pass over a receive span.
#[derive(Debug)]
pub struct UnpackOutcome {
    /// Words consumed from the front of the span. A trailing partial message
    /// is left unconsumed for the next pass.
    pub consumed_words: usize,
    /// The sink requested backpressure; resume from the unconsumed suffix.
    pub stop: bool,
    /// First decode error, if any. The caller flags the peer bad-data.
    pub error: Option<TransporterError>,
}

enum OneSignal<'a> {
    Ok {
        words: usize,
        prio: u8,
        header: SignalHeader,
        data: &'a [u32],
        sections: [&'a [u32]; MAX_SECTIONS],
    },
    Partial,
    Bad(TransporterError),
}

fn unpack_one(buf: &[u32]) -> OneSignal<'_> {
    let word1 = buf[0];

    if !native_byte_order(word1) {
        return OneSignal::Bad(TransporterError::InvalidByteOrder);
    }
    if get_compressed(word1) {
        return OneSignal::Bad(TransporterError::CompressedUnsupported);
    }

    let len_words = get_message_length(word1);
    if len_words == 0 || len_words > MAX_RECV_MESSAGE_WORDS {
        return OneSignal::Bad(TransporterError::InvalidMessageLength);
    }
    let len_words = len_words as usize;
    if buf.len() < len_words {
        return OneSignal::Partial;
    }

    if get_checksum_included(word1) {
        let sent = buf[len_words - 1];
        if compute_checksum(&buf[..len_words - 1]) != sent {
            return OneSignal::Bad(TransporterError::InvalidChecksum);
        }
    }

    let mut header = decode_header(word1, buf[1], buf[2]);
    let prio = proto::get_prio(word1);

    let mut at = PROTOCOL_WORDS as usize;
    if get_signal_id_included(word1) {
        if at >= len_words {
            return OneSignal::Bad(TransporterError::InvalidMessageLength);
        }
        header.sender_signal_id = buf[at];
        at += 1;
    }

    let data_end = at + header.length as usize;
    let sec_count = header.section_count as usize;
    if data_end + sec_count > len_words {
        return OneSignal::Bad(TransporterError::InvalidMessageLength);
    }
    let data = &buf[at..data_end];

    let mut sections: [&[u32]; MAX_SECTIONS] = [&[], &[], &[]];
    let mut body_at = data_end + sec_count;
    for (i, section) in sections.iter_mut().enumerate().take(sec_count) {
        let sz = buf[data_end + i] as usize;
        if body_at + sz > len_words {
            return OneSignal::Bad(TransporterError::InvalidMessageLength);
        }
        *section = &buf[body_at..body_at + sz];
        body_at += sz;
    }

    // every word of the message must be accounted for
    if body_at + usize::from(get_checksum_included(word1)) != len_words {
        return OneSignal::Bad(TransporterError::InvalidMessageLength);
    }

    OneSignal::Ok { words: len_words, prio, header, data, sections }
}

/// Walk framed messages in `buf`, delivering each through `sink`.
///
/// Messages are tagged with `peer` by rewriting the sender block reference.
/// Under a halted-input state everything not addressed to the management
/// block is consumed but silently dropped. At most `MAX_RECEIVED_SIGNALS`
/// signals are delivered per call so one noisy peer cannot starve the rest.
pub fn unpack(buf: &[u32], peer: NodeId, state: IoState, sink: &dyn SignalSink) -> UnpackOutcome {
    let halted = state.input_halted();
    let mut at = 0usize;
    let mut delivered = 0u32;
    let mut stop = false;
    let mut err = None;

    while buf.len() - at >= 1 + PROTOCOL_WORDS as usize
        && delivered < MAX_RECEIVED_SIGNALS
        && !stop
    {
        match unpack_one(&buf[at..]) {
            OneSignal::Ok { words, prio, mut header, data, sections } => {
                at += words;
                delivered += 1;

                if halted && header.receiver_block != QMGR_BLOCK {
                    continue;
                }
                header.sender_block_ref = number_to_ref(header.sender_block_ref, peer);
                let secs = &sections[..header.section_count as usize];
                stop = sink.deliver_signal(&header, prio, None, data, secs)
                    == DeliveryOutcome::Stop;
            }
            OneSignal::Partial => break,
            OneSignal::Bad(e) => {
                dump_bad_message(peer, e, &buf[at..]);
                err = Some(e);
                break;
            }
        }
    }

    UnpackOutcome { consumed_words: at, stop, error: err }
}

/// Hex context around a framing failure, through the logger. Bounded so one
/// corrupt burst cannot flood the log.
fn dump_bad_message(peer: NodeId, e: TransporterError, buf: &[u32]) {
    const DUMP_WORDS: usize = 60;
    let mut dump = String::new();
    for (i, w) in buf.iter().take(DUMP_WORDS).enumerate() {
        if i % 8 == 0 {
            dump.push_str(&format!("\n{i:04}:"));
        }
        dump.push_str(&format!(" {w:08x}"));
    }
    error!(
        peer,
        error = %e,
        remaining_words = buf.len(),
        "bad message from peer, discarding input until reconnect{dump}"
    );
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{LinearSections, Packer, block_ref_block, block_ref_node};

    struct Recorder {
        seen: RefCell<Vec<(SignalHeader, u8, Vec<u32>, Vec<Vec<u32>>)>>,
        stop_after: usize,
    }

    impl Recorder {
        fn new() -> Self {
            Self { seen: RefCell::new(Vec::new()), stop_after: usize::MAX }
        }

        fn stopping_after(n: usize) -> Self {
            Self { seen: RefCell::new(Vec::new()), stop_after: n }
        }
    }

    impl SignalSink for Recorder {
        fn deliver_signal(
            &self,
            header: &SignalHeader,
            prio: u8,
            _err: Option<TransporterError>,
            data: &[u32],
            sections: &[&[u32]],
        ) -> DeliveryOutcome {
            let mut seen = self.seen.borrow_mut();
            seen.push((
                header.clone(),
                prio,
                data.to_vec(),
                sections.iter().map(|s| s.to_vec()).collect(),
            ));
            if seen.len() >= self.stop_after {
                DeliveryOutcome::Stop
            } else {
                DeliveryOutcome::Continue
            }
        }
    }

    fn packed(packer: &Packer, header: &SignalHeader, data: &[u32], secs: &[&[u32]]) -> Vec<u32> {
        let mut src = LinearSections::new(secs);
        let len = packer.message_len_words(header, &src) as usize;
        let mut out = vec![0u32; len];
        packer.pack(&mut out, 1, header, data, &mut src);
        out
    }

    #[test]
    fn roundtrip_header_data_sections() {
        let packer = Packer::new(true, true);
        let mut header = SignalHeader::new(42, 10, 20, 3);
        header.section_count = 2;
        header.signal_id = 77;
        header.trace = 9;
        header.fragment_info = 2;
        let data = [0xDEADu32, 0xBEEF, 0xCAFE];
        let s0 = [1u32, 2, 3];
        let s1 = [4u32; 7];
        let buf = packed(&packer, &header, &data, &[&s0[..], &s1[..]]);

        let rec = Recorder::new();
        let out = unpack(&buf, 5, IoState::NoHalt, &rec);
        assert_eq!(out.consumed_words, buf.len());
        assert!(out.error.is_none());
        assert!(!out.stop);

        let seen = rec.seen.borrow();
        assert_eq!(seen.len(), 1);
        let (h, prio, d, secs) = &seen[0];
        assert_eq!(*prio, 1);
        assert_eq!(h.gsn, 42);
        assert_eq!(h.receiver_block, 10);
        // the sender ref is rewritten to embed the peer
        assert_eq!(block_ref_block(h.sender_block_ref), 20);
        assert_eq!(block_ref_node(h.sender_block_ref), 5);
        assert_eq!(h.trace, 9);
        assert_eq!(h.fragment_info, 2);
        assert_eq!(h.sender_signal_id, 77);
        assert_eq!(d, &data);
        assert_eq!(secs.len(), 2);
        assert_eq!(secs[0], &s0);
        assert_eq!(secs[1], &s1);
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let packer = Packer::new(false, true);
        let header = SignalHeader::new(42, 10, 20, 3);
        let mut buf = packed(&packer, &header, &[0xDEAD, 0xBEEF, 0xCAFE], &[]);
        buf[4] ^= 0x0100;

        let rec = Recorder::new();
        let out = unpack(&buf, 5, IoState::NoHalt, &rec);
        assert_eq!(out.error, Some(TransporterError::InvalidChecksum));
        assert_eq!(out.consumed_words, 0);
        assert!(rec.seen.borrow().is_empty());
    }

    #[test]
    fn checksum_off_does_not_detect_corruption() {
        let packer = Packer::new(false, false);
        let header = SignalHeader::new(42, 10, 20, 1);
        let mut buf = packed(&packer, &header, &[7], &[]);
        buf[3] ^= 0x0100;

        let rec = Recorder::new();
        let out = unpack(&buf, 5, IoState::NoHalt, &rec);
        assert!(out.error.is_none());
        assert_eq!(rec.seen.borrow()[0].2, vec![7 ^ 0x0100]);
    }

    #[test]
    fn foreign_byte_order_rejected() {
        let packer = Packer::new(false, false);
        let header = SignalHeader::new(1, 2, 3, 0);
        let mut buf = packed(&packer, &header, &[], &[]);
        buf[0] ^= 0x8100_0081;
        // keep the loop's 4-word minimum satisfied
        buf.push(0);

        let rec = Recorder::new();
        let out = unpack(&buf, 5, IoState::NoHalt, &rec);
        assert_eq!(out.error, Some(TransporterError::InvalidByteOrder));
    }

    #[test]
    fn zero_and_oversize_lengths_rejected() {
        let packer = Packer::new(false, false);
        let header = SignalHeader::new(1, 2, 3, 1);
        let good = packed(&packer, &header, &[1], &[]);

        let mut zeroed = good.clone();
        zeroed[0] &= !0x00FF_FF00;
        let out = unpack(&zeroed, 5, IoState::NoHalt, &Recorder::new());
        assert_eq!(out.error, Some(TransporterError::InvalidMessageLength));

        let mut huge = good;
        huge[0] |= 0x00FF_FF00;
        let out = unpack(&huge, 5, IoState::NoHalt, &Recorder::new());
        assert_eq!(out.error, Some(TransporterError::InvalidMessageLength));
    }

    #[test]
    fn partial_message_left_unconsumed() {
        let packer = Packer::new(false, false);
        let header = SignalHeader::new(1, 2, 3, 20);
        let data = [3u32; 20];
        let whole = packed(&packer, &header, &data, &[]);

        let rec = Recorder::new();
        let out = unpack(&whole[..8], 5, IoState::NoHalt, &rec);
        assert_eq!(out.consumed_words, 0);
        assert!(out.error.is_none());
        assert!(rec.seen.borrow().is_empty());

        // first message complete, second truncated: only the first consumed
        let mut two = whole.clone();
        two.extend_from_slice(&whole[..8]);
        let out = unpack(&two, 5, IoState::NoHalt, &rec);
        assert_eq!(out.consumed_words, whole.len());
        assert_eq!(rec.seen.borrow().len(), 1);
    }

    #[test]
    fn stop_suspends_at_iteration_boundary() {
        let packer = Packer::new(false, false);
        let header = SignalHeader::new(1, 2, 3, 1);
        let mut buf = Vec::new();
        for i in 0..10u32 {
            buf.extend_from_slice(&packed(&packer, &header, &[i], &[]));
        }
        let msg_words = buf.len() / 10;

        let rec = Recorder::stopping_after(3);
        let out = unpack(&buf, 5, IoState::NoHalt, &rec);
        assert!(out.stop);
        assert_eq!(out.consumed_words, 3 * msg_words);
        assert_eq!(rec.seen.borrow().len(), 3);

        // the suffix delivers the remaining seven
        let out = unpack(&buf[out.consumed_words..], 5, IoState::NoHalt, &rec);
        assert!(!out.stop);
        assert_eq!(rec.seen.borrow().len(), 10);
    }

    #[test]
    fn halted_input_delivers_only_qmgr() {
        let packer = Packer::new(false, false);
        let to_app = SignalHeader::new(1, 7, 3, 0);
        let to_qmgr = SignalHeader::new(1, QMGR_BLOCK, 3, 0);
        let mut buf = Vec::new();
        buf.extend_from_slice(&packed(&packer, &to_app, &[], &[]));
        buf.extend_from_slice(&packed(&packer, &to_qmgr, &[], &[]));
        buf.push(0); // trailer so the last 3-word message clears the loop bound

        for state in [IoState::HaltInput, IoState::HaltIO] {
            let rec = Recorder::new();
            let out = unpack(&buf, 5, state, &rec);
            assert!(out.error.is_none());
            let seen = rec.seen.borrow();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].0.receiver_block, QMGR_BLOCK);
        }

        let rec = Recorder::new();
        unpack(&buf, 5, IoState::HaltOutput, &rec);
        assert_eq!(rec.seen.borrow().len(), 2);
    }
}
