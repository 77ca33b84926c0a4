use crate::{
    SignalHeader,
    proto::{
        self, PROTOCOL_WORDS, compute_checksum, encode_header, own_byte_order, set_byte_order,
        set_checksum_included, set_compressed, set_message_length, set_prio,
        set_signal_id_included,
    },
    sections::SectionSource,
};

/// Frames signals into wire messages. One packer per peer; the signal-id and
/// checksum options are negotiated at configuration time and baked into a
/// precomputed word 1.
#[derive(Debug, Clone, Copy)]
pub struct Packer {
    precomputed_word1: u32,
    signal_id_used: bool,
    checksum_used: bool,
}

impl Packer {
    pub fn new(signal_id_used: bool, checksum_used: bool) -> Self {
        let mut word1 = 0;
        set_byte_order(&mut word1, own_byte_order());
        set_signal_id_included(&mut word1, u32::from(signal_id_used));
        set_checksum_included(&mut word1, u32::from(checksum_used));
        set_compressed(&mut word1, 0);
        Self { precomputed_word1: word1, signal_id_used, checksum_used }
    }

    #[inline]
    pub fn signal_id_used(&self) -> bool {
        self.signal_id_used
    }

    #[inline]
    pub fn checksum_used(&self) -> bool {
        self.checksum_used
    }

    /// Framed size of this signal, in words.
    pub fn message_len_words<S: SectionSource>(&self, header: &SignalHeader, sections: &S) -> u32 {
        let mut len = PROTOCOL_WORDS
            + u32::from(self.signal_id_used)
            + header.length
            + sections.count() as u32
            + u32::from(self.checksum_used);
        for i in 0..sections.count() {
            len += sections.len_words(i);
        }
        len
    }

    /// Framed size in bytes, as budgeted against `MAX_MESSAGE_SIZE`.
    pub fn message_len_bytes<S: SectionSource>(&self, header: &SignalHeader, sections: &S) -> u32 {
        self.message_len_words(header, sections) * 4
    }

    /// Write one framed message into `dst`, which must be exactly
    /// `message_len_words` long (the buffer layer hands out exact regions).
    pub fn pack<S: SectionSource>(
        &self,
        dst: &mut [u32],
        prio: u8,
        header: &SignalHeader,
        data: &[u32],
        sections: &mut S,
    ) {
        let len_words = self.message_len_words(header, sections);
        debug_assert_eq!(dst.len(), len_words as usize);
        debug_assert_eq!(data.len() as u32, header.length);
        debug_assert_eq!(sections.count() as u32, header.section_count);

        let mut word1 = self.precomputed_word1;
        let mut word2 = 0;
        let mut word3 = 0;
        set_prio(&mut word1, u32::from(prio));
        set_message_length(&mut word1, len_words);
        encode_header(&mut word1, &mut word2, &mut word3, header);

        dst[0] = word1;
        dst[1] = word2;
        dst[2] = word3;

        let mut at = PROTOCOL_WORDS as usize;
        if self.signal_id_used {
            dst[at] = header.signal_id;
            at += 1;
        }

        dst[at..at + data.len()].copy_from_slice(data);
        at += data.len();

        let n_secs = sections.count();
        let mut body_at = at + n_secs;
        for i in 0..n_secs {
            let sz = sections.len_words(i);
            dst[at + i] = sz;
            sections.import(i, &mut dst[body_at..body_at + sz as usize]);
            body_at += sz as usize;
        }
        at = body_at;

        if self.checksum_used {
            dst[at] = compute_checksum(&dst[..at]);
            at += 1;
        }
        debug_assert_eq!(at as u32, len_words);
    }
}

impl Default for Packer {
    fn default() -> Self {
        Self::new(false, false)
    }
}

/// True when `word1` announces our own byte order; mixed-endian peers are
/// rejected at unpack.
#[inline]
pub(crate) fn native_byte_order(word1: u32) -> bool {
    proto::verify_byte_order(word1, own_byte_order())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::{
        GenericSections, LinearSections, SegmentPool, SegmentedSections, SliceSectionIterator,
    };

    #[test]
    fn minimal_message_is_three_words() {
        let packer = Packer::new(false, false);
        let header = SignalHeader::new(1, 2, 3, 0);
        let mut secs = LinearSections::new(&[]);
        assert_eq!(packer.message_len_words(&header, &secs), 3);

        let mut out = [0u32; 3];
        packer.pack(&mut out, 1, &header, &[], &mut secs);
        assert_eq!(proto::get_message_length(out[0]), 3);
        assert_eq!(proto::get_prio(out[0]), 1);
    }

    #[test]
    fn options_grow_the_frame() {
        let header = SignalHeader::new(1, 2, 3, 2);
        let s0 = [9u32; 5];
        let binding = [&s0[..]];

        let plain = Packer::new(false, false);
        let full = Packer::new(true, true);
        let mut h = header.clone();
        h.section_count = 1;

        assert_eq!(plain.message_len_words(&h, &LinearSections::new(&binding)), 3 + 2 + 1 + 5);
        assert_eq!(full.message_len_words(&h, &LinearSections::new(&binding)), 3 + 1 + 2 + 1 + 5 + 1);
    }

    #[test]
    fn every_section_flavor_frames_identically() {
        let packer = Packer::new(false, false);
        let mut header = SignalHeader::new(9, 1, 2, 0);
        header.section_count = 1;
        let words: Vec<u32> = (0..130).collect();

        let words_slice = words.as_slice();
        let mut linear = LinearSections::new(std::slice::from_ref(&words_slice));
        let len = packer.message_len_words(&header, &linear) as usize;
        let mut linear_out = vec![0u32; len];
        packer.pack(&mut linear_out, 0, &header, &[], &mut linear);

        let mut iter = SliceSectionIterator::new(&words, 60);
        let mut generic = GenericSections::new(vec![(130, &mut iter)]);
        let mut generic_out = vec![0u32; len];
        packer.pack(&mut generic_out, 0, &header, &[], &mut generic);
        assert_eq!(linear_out, generic_out);

        let mut pool = SegmentPool::new(4);
        let stored = pool.store(&words).unwrap();
        let mut segmented = SegmentedSections::new(&pool, std::slice::from_ref(&stored));
        let mut segmented_out = vec![0u32; len];
        packer.pack(&mut segmented_out, 0, &header, &[], &mut segmented);
        assert_eq!(linear_out, segmented_out);
    }

    #[test]
    fn checksum_word_covers_whole_frame() {
        let packer = Packer::new(false, true);
        let mut header = SignalHeader::new(42, 10, 20, 3);
        header.trace = 5;
        let data = [0xDEADu32, 0xBEEF, 0xCAFE];
        let mut secs = LinearSections::new(&[]);

        let len = packer.message_len_words(&header, &secs) as usize;
        let mut out = vec![0u32; len];
        packer.pack(&mut out, 0, &header, &data, &mut secs);

        let (body, tail) = out.split_at(len - 1);
        assert_eq!(tail[0], compute_checksum(body));
    }
}
