use tokio::time::Instant;

use super::{PingResult, ResultKind};

/// Default number of probes the history retains.
pub const DEFAULT_HISTORY: usize = 300;

/// Fixed-capacity ring of probe outcomes, indexed by `seq % capacity`.
///
/// A slot is authoritative only while its stored sequence matches the
/// one being looked up; once more than `capacity` probes have been sent
/// since, the slot has been reused and the old result is gone.
#[derive(Clone, Debug)]
pub struct History {
    slots: Vec<Option<PingResult>>,
    last_seq: Option<u16>,
}

impl History {
    pub fn new(capacity: usize) -> History {
        assert!(capacity > 0, "history capacity must not be zero");
        History {
            slots: vec![None; capacity],
            last_seq: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Highest sequence number handed out so far.
    pub fn last_seq(&self) -> Option<u16> {
        self.last_seq
    }

    /// Allocates the next sequence number and records its slot as
    /// waiting.
    pub fn record_sent(&mut self, sent_at: Instant) -> u16 {
        let seq = match self.last_seq {
            Some(last) => last.wrapping_add(1),
            None => 0,
        };
        self.last_seq = Some(seq);
        let index = self.index_of(seq);
        self.slots[index] = Some(PingResult::waiting(seq, sent_at));
        seq
    }

    /// The slot of `seq`, if it still belongs to that sequence.
    pub fn slot_mut(&mut self, seq: u16) -> Option<&mut PingResult> {
        let index = self.index_of(seq);
        self.slots[index].as_mut().filter(|slot| slot.seq == seq)
    }

    /// Read-only variant of [`History::slot_mut`].
    pub fn slot(&self, seq: u16) -> Option<&PingResult> {
        let index = self.index_of(seq);
        self.slots[index].as_ref().filter(|slot| slot.seq == seq)
    }

    /// Most recently sent probe's slot.
    pub fn latest(&self) -> Option<&PingResult> {
        self.slot(self.last_seq?)
    }

    /// Outcomes newest first, at most `capacity` entries.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &PingResult> + '_ {
        let last = self.last_seq;
        (0..self.capacity() as u16)
            .filter_map(move |offset| self.slot(last?.wrapping_sub(offset)))
    }

    /// Number of probes that have been resolved as lost so far is
    /// derivable from stats; what the display also wants is how many
    /// slots are still waiting.
    pub fn waiting(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| slot.kind == ResultKind::Waiting)
            .count()
    }

    fn index_of(&self, seq: u16) -> usize {
        usize::from(seq) % self.capacity()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn sequences_start_at_zero_and_increment() {
        let mut history = History::new(8);
        let now = Instant::now();
        assert_eq!(0, history.record_sent(now));
        assert_eq!(1, history.record_sent(now));
        assert_eq!(2, history.record_sent(now));
        assert_eq!(Some(2), history.last_seq());
    }

    #[tokio::test]
    async fn slot_lookup_validates_the_sequence() {
        let mut history = History::new(4);
        let now = Instant::now();
        for _ in 0..4 {
            history.record_sent(now);
        }
        assert!(history.slot(0).is_some());
        // five more sends overwrite every slot
        for _ in 0..5 {
            history.record_sent(now);
        }
        assert!(history.slot(0).is_none(), "stale slot must not resolve");
        assert!(history.slot(8).is_some());
    }

    #[tokio::test]
    async fn iter_newest_first_orders_and_stops() {
        let mut history = History::new(4);
        let now = Instant::now();
        for _ in 0..6 {
            history.record_sent(now);
        }
        let seqs: Vec<u16> = history.iter_newest_first().map(|r| r.seq).collect();
        assert_eq!(vec![5, 4, 3, 2], seqs);
    }

    #[tokio::test]
    async fn sequence_wraps_around() {
        let mut history = History::new(4);
        let now = Instant::now();
        // force the counter near the wrap point
        history.last_seq = Some(u16::MAX - 1);
        assert_eq!(u16::MAX, history.record_sent(now));
        assert_eq!(0, history.record_sent(now));
        assert!(history.slot(u16::MAX).is_some());
        assert!(history.slot(0).is_some());
    }
}
