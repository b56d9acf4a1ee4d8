use super::*;

/// In-memory log tail anchored at the last snapshot.
///
/// `entries[0]` is a sentinel carrying the snapshot's `(term, index)`, so the
/// tail is dense from the snapshot index onward and index arithmetic never
/// needs a special case for an empty log.
pub(crate) struct CommandLog {
    entries: Vec<LogEntry>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::anchored(0, 0)
    }

    pub fn anchored(index: Index, term: Term) -> Self {
        Self {
            entries: vec![LogEntry {
                term,
                index,
                command: Bytes::new(),
            }],
        }
    }

    pub fn from_parts(index: Index, term: Term, tail: Vec<LogEntry>) -> Self {
        let mut log = Self::anchored(index, term);
        log.entries.extend(tail);
        log
    }

    /// Index of the sentinel, i.e. the last snapshotted index.
    pub fn first_index(&self) -> Index {
        self.entries[0].index
    }

    pub fn first_term(&self) -> Term {
        self.entries[0].term
    }

    pub fn last_index(&self) -> Index {
        self.entries.last().unwrap().index
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().unwrap().term
    }

    fn pos(&self, index: Index) -> Option<usize> {
        if index < self.first_index() || index > self.last_index() {
            None
        } else {
            Some((index - self.first_index()) as usize)
        }
    }

    pub fn term_at(&self, index: Index) -> Option<Term> {
        self.pos(index).map(|i| self.entries[i].term)
    }

    pub fn get(&self, index: Index) -> Option<&LogEntry> {
        self.pos(index).map(|i| &self.entries[i])
    }

    /// Everything after the sentinel.
    pub fn tail(&self) -> &[LogEntry] {
        &self.entries[1..]
    }

    /// Clone of `[from, last]`. Empty when `from` is past the end.
    pub fn suffix(&self, from: Index) -> Vec<LogEntry> {
        match self.pos(from) {
            Some(i) => self.entries[i..].to_vec(),
            None => vec![],
        }
    }

    pub fn push(&mut self, e: LogEntry) {
        debug_assert_eq!(e.index, self.last_index() + 1);
        self.entries.push(e);
    }

    /// Drop `index` and everything after it. The sentinel is never dropped.
    pub fn truncate_from(&mut self, index: Index) {
        if let Some(i) = self.pos(index) {
            self.entries.truncate(i.max(1));
        }
    }

    pub fn first_index_of_term(&self, term: Term) -> Option<Index> {
        self.entries.iter().find(|e| e.term == term).map(|e| e.index)
    }

    pub fn last_index_of_term(&self, term: Term) -> Option<Index> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Discard everything through `index`, making it the new anchor.
    ///
    /// A suffix strictly after `index` survives only if the entry at `index`
    /// agrees on `term`; otherwise the whole log is replaced by the anchor.
    pub fn compact(&mut self, index: Index, term: Term) {
        match self.pos(index) {
            Some(i) if self.entries[i].term == term => {
                self.entries.drain(..i);
                self.entries[0].command = Bytes::new();
            }
            _ => *self = Self::anchored(index, term),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: Term, index: Index) -> LogEntry {
        LogEntry {
            term,
            index,
            command: Bytes::from(format!("e{index}")),
        }
    }

    fn sample() -> CommandLog {
        // terms: 1 1 2 2 3
        let mut log = CommandLog::new();
        for (t, i) in [(1, 1), (1, 2), (2, 3), (2, 4), (3, 5)] {
            log.push(entry(t, i));
        }
        log
    }

    #[test]
    fn dense_indexing() {
        let log = sample();
        assert_eq!(log.first_index(), 0);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.term_at(6), None);
    }

    #[test]
    fn term_boundaries() {
        let log = sample();
        assert_eq!(log.first_index_of_term(2), Some(3));
        assert_eq!(log.last_index_of_term(2), Some(4));
        assert_eq!(log.first_index_of_term(9), None);
    }

    #[test]
    fn truncate_keeps_sentinel() {
        let mut log = sample();
        log.truncate_from(3);
        assert_eq!(log.last_index(), 2);
        log.truncate_from(0);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.first_index(), 0);
    }

    #[test]
    fn compact_retains_matching_suffix() {
        let mut log = sample();
        log.compact(3, 2);
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.first_term(), 2);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.term_at(4), Some(2));
        // suffix entries are intact, the anchor's payload is cleared
        assert!(log.get(3).unwrap().command.is_empty());
        assert_eq!(log.get(5).unwrap().command, Bytes::from("e5"));
    }

    #[test]
    fn compact_reinitializes_on_mismatch() {
        let mut log = sample();
        // a snapshot past our log, or disagreeing on the term, wipes the tail
        log.compact(10, 4);
        assert_eq!(log.first_index(), 10);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.first_term(), 4);
    }
}
