//! The three representations a trailing section may arrive in at pack time:
//! plain slices, caller-driven iterators, and the engine's segmented pool.

/// Source of section payloads for `Packer::pack`. `len_words` must agree
/// with what `import` writes; the packer sizes the message from it.
pub trait SectionSource {
    fn count(&self) -> usize;
    fn len_words(&self, i: usize) -> u32;
    /// Copy section `i` into `dst`. `dst.len() == len_words(i)`.
    fn import(&mut self, i: usize, dst: &mut [u32]);
}

/// Contiguous in-memory sections.
pub struct LinearSections<'a> {
    ptrs: &'a [&'a [u32]],
}

impl<'a> LinearSections<'a> {
    pub fn new(ptrs: &'a [&'a [u32]]) -> Self {
        debug_assert!(ptrs.len() <= crate::MAX_SECTIONS);
        Self { ptrs }
    }

    pub fn total_words(&self) -> u32 {
        self.ptrs.iter().map(|p| p.len() as u32).sum()
    }
}

impl SectionSource for LinearSections<'_> {
    fn count(&self) -> usize {
        self.ptrs.len()
    }

    fn len_words(&self, i: usize) -> u32 {
        self.ptrs[i].len() as u32
    }

    fn import(&mut self, i: usize, dst: &mut [u32]) {
        dst.copy_from_slice(self.ptrs[i]);
    }
}

/// Streams one section's words in caller-defined chunks.
pub trait SectionIterator {
    /// Next run of words, or `None` when the section is exhausted.
    fn next_words(&mut self) -> Option<&[u32]>;
}

/// Adapter exposing a slice through the iterator interface, chunked.
pub struct SliceSectionIterator<'a> {
    rest: &'a [u32],
    chunk: usize,
}

impl<'a> SliceSectionIterator<'a> {
    pub fn new(words: &'a [u32], chunk: usize) -> Self {
        assert!(chunk > 0);
        Self { rest: words, chunk }
    }
}

impl SectionIterator for SliceSectionIterator<'_> {
    fn next_words(&mut self) -> Option<&[u32]> {
        if self.rest.is_empty() {
            return None;
        }
        let n = self.rest.len().min(self.chunk);
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Some(head)
    }
}

/// Iterator-driven sections: each entry declares its total length up front
/// and streams its words on demand.
pub struct GenericSections<'a> {
    sections: Vec<(u32, &'a mut dyn SectionIterator)>,
}

impl<'a> GenericSections<'a> {
    pub fn new(sections: Vec<(u32, &'a mut dyn SectionIterator)>) -> Self {
        debug_assert!(sections.len() <= crate::MAX_SECTIONS);
        Self { sections }
    }
}

impl SectionSource for GenericSections<'_> {
    fn count(&self) -> usize {
        self.sections.len()
    }

    fn len_words(&self, i: usize) -> u32 {
        self.sections[i].0
    }

    fn import(&mut self, i: usize, dst: &mut [u32]) {
        let (declared, iter) = &mut self.sections[i];
        let mut off = 0usize;
        while let Some(run) = iter.next_words() {
            dst[off..off + run.len()].copy_from_slice(run);
            off += run.len();
        }
        debug_assert_eq!(off as u32, *declared);
    }
}

/// Words per pool segment.
pub const SEGMENT_WORDS: usize = 60;

const NIL: u32 = !0;

struct Segment {
    next: u32,
    data: [u32; SEGMENT_WORDS],
}

/// Handle to a chain of pool segments holding one section.
#[derive(Debug, Clone, Copy)]
pub struct SegmentedSection {
    first: u32,
    /// Length in words.
    pub len: u32,
}

/// Fixed-capacity pool of linked segments. The upstream engine shares one of
/// these with its long-signal storage; here it only needs to hold section
/// payloads between `store` and `pack`.
pub struct SegmentPool {
    segments: Vec<Segment>,
    free_head: u32,
}

impl SegmentPool {
    pub fn new(n_segments: usize) -> Self {
        let mut segments = Vec::with_capacity(n_segments);
        for i in 0..n_segments {
            let next = if i + 1 < n_segments { (i + 1) as u32 } else { NIL };
            segments.push(Segment { next, data: [0; SEGMENT_WORDS] });
        }
        Self { segments, free_head: if n_segments == 0 { NIL } else { 0 } }
    }

    fn seize(&mut self) -> Option<u32> {
        let head = self.free_head;
        if head == NIL {
            return None;
        }
        self.free_head = self.segments[head as usize].next;
        self.segments[head as usize].next = NIL;
        Some(head)
    }

    /// Copy `words` into a fresh segment chain. `None` when the pool cannot
    /// hold them; nothing is seized in that case.
    pub fn store(&mut self, words: &[u32]) -> Option<SegmentedSection> {
        let needed = words.len().div_ceil(SEGMENT_WORDS).max(1);
        if self.free_segments() < needed {
            return None;
        }

        let first = self.seize().expect("free count checked");
        let mut cur = first;
        for (i, chunk) in words.chunks(SEGMENT_WORDS).enumerate() {
            if i > 0 {
                let next = self.seize().expect("free count checked");
                self.segments[cur as usize].next = next;
                cur = next;
            }
            self.segments[cur as usize].data[..chunk.len()].copy_from_slice(chunk);
        }
        Some(SegmentedSection { first, len: words.len() as u32 })
    }

    /// Return a chain to the free list.
    pub fn release(&mut self, section: SegmentedSection) {
        let mut cur = section.first;
        while cur != NIL {
            let next = self.segments[cur as usize].next;
            self.segments[cur as usize].next = self.free_head;
            self.free_head = cur;
            cur = next;
        }
    }

    pub fn free_segments(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free_head;
        while cur != NIL {
            n += 1;
            cur = self.segments[cur as usize].next;
        }
        n
    }

    fn copy_out(&self, section: &SegmentedSection, dst: &mut [u32]) {
        let mut cur = section.first;
        let mut remain = section.len as usize;
        let mut off = 0usize;
        while remain > 0 {
            debug_assert_ne!(cur, NIL);
            let take = remain.min(SEGMENT_WORDS);
            dst[off..off + take].copy_from_slice(&self.segments[cur as usize].data[..take]);
            off += take;
            remain -= take;
            cur = self.segments[cur as usize].next;
        }
    }
}

/// Pool-backed sections.
pub struct SegmentedSections<'a> {
    pool: &'a SegmentPool,
    ptrs: &'a [SegmentedSection],
}

impl<'a> SegmentedSections<'a> {
    pub fn new(pool: &'a SegmentPool, ptrs: &'a [SegmentedSection]) -> Self {
        debug_assert!(ptrs.len() <= crate::MAX_SECTIONS);
        Self { pool, ptrs }
    }
}

impl SectionSource for SegmentedSections<'_> {
    fn count(&self) -> usize {
        self.ptrs.len()
    }

    fn len_words(&self, i: usize) -> u32 {
        self.ptrs[i].len
    }

    fn import(&mut self, i: usize, dst: &mut [u32]) {
        self.pool.copy_out(&self.ptrs[i], dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_iterator_chunks() {
        let words: Vec<u32> = (0..130).collect();
        let mut it = SliceSectionIterator::new(&words, 60);
        assert_eq!(it.next_words().unwrap().len(), 60);
        assert_eq!(it.next_words().unwrap().len(), 60);
        assert_eq!(it.next_words().unwrap(), &[120, 121, 122, 123, 124, 125, 126, 127, 128, 129]);
        assert!(it.next_words().is_none());
    }

    #[test]
    fn pool_store_release() {
        let mut pool = SegmentPool::new(4);
        assert_eq!(pool.free_segments(), 4);

        let words: Vec<u32> = (0..150).collect();
        let sec = pool.store(&words).unwrap();
        assert_eq!(pool.free_segments(), 1);

        let mut out = vec![0u32; 150];
        SegmentedSections::new(&pool, std::slice::from_ref(&sec)).import(0, &mut out);
        assert_eq!(out, words);

        // a fourth chain of this size no longer fits
        assert!(pool.store(&words).is_none());

        pool.release(sec);
        assert_eq!(pool.free_segments(), 4);
    }

    #[test]
    fn pool_empty_section_takes_one_segment() {
        let mut pool = SegmentPool::new(2);
        let sec = pool.store(&[]).unwrap();
        assert_eq!(sec.len, 0);
        assert_eq!(pool.free_segments(), 1);
        pool.release(sec);
        assert_eq!(pool.free_segments(), 2);
    }
}
