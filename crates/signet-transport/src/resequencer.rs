use std::collections::VecDeque;

use signet_wire::TransporterError;

/// What became of an offered signal.
#[derive(Debug, PartialEq, Eq)]
pub enum Resequenced<T> {
    /// The offered signal (and any held successors it unblocked), in
    /// sequence order.
    Deliver(Vec<T>),
    /// Ahead of the expected id; parked on the wait stack.
    Held,
    /// Sequencing is broken for this peer. `TooSmallSigId`,
    /// `TooLargeSigId` or `WaitStackFull`.
    Fatal(TransporterError),
}

/// Restores a strictly increasing sequence over numbered signals that a
/// backend may reorder between its priority channels. Priority-A traffic
/// bypasses this entirely; only numbered data signals pass through.
pub struct Resequencer<T> {
    next_expected: u32,
    stack: VecDeque<(u32, T)>,
    capacity: usize,
}

impl<T> Resequencer<T> {
    pub fn new(capacity: usize) -> Self {
        Self { next_expected: 0, stack: VecDeque::with_capacity(capacity), capacity }
    }

    #[inline]
    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    #[inline]
    pub fn held(&self) -> usize {
        self.stack.len()
    }

    pub fn offer(&mut self, sig_id: u32, item: T) -> Resequenced<T> {
        if sig_id == self.next_expected {
            let mut out = vec![item];
            self.next_expected = self.next_expected.wrapping_add(1);
            self.drain_ready(&mut out);
            return Resequenced::Deliver(out);
        }
        if sig_id < self.next_expected {
            return Resequenced::Fatal(TransporterError::TooSmallSigId);
        }
        if sig_id > self.next_expected + self.capacity as u32 {
            return Resequenced::Fatal(TransporterError::TooLargeSigId);
        }
        if self.stack.len() >= self.capacity {
            // duplicates are the only way a bounded window overflows; the
            // sequence is not trustworthy anymore
            return Resequenced::Fatal(TransporterError::WaitStackFull);
        }
        self.stack.push_back((sig_id, item));
        Resequenced::Held
    }

    /// Splice every held signal that is next in sequence.
    fn drain_ready(&mut self, out: &mut Vec<T>) {
        loop {
            let Some(pos) = self.stack.iter().position(|(id, _)| *id == self.next_expected)
            else {
                return;
            };
            let (_, item) = self.stack.remove(pos).expect("position came from iter");
            out.push(item);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
    }

    /// Disconnect: drop held signals, restart the sequence at zero.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.next_expected = 0;
    }
}
