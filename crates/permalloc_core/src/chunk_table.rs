//! Per-chunk ownership and the free-run tracker for large objects.

use crate::bin::BinIndex;
use std::collections::BTreeMap;

/// What a chunk is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkKind {
    /// Mapped but not owned by any bin.
    Unused,
    /// Carved into blocks of one small bin. Never returned to `Unused`.
    Small { bin: u32 },
    /// First chunk of a large object spanning `chunks` chunks.
    LargeHead { chunks: u32 },
    /// Continuation of a large object.
    LargeBody,
}

impl ChunkKind {
    pub(crate) fn tag(self) -> (u8, u32) {
        match self {
            Self::Unused => (0, 0),
            Self::Small { bin } => (1, bin),
            Self::LargeHead { chunks } => (2, chunks),
            Self::LargeBody => (3, 0),
        }
    }

    pub(crate) fn from_tag(tag: u8, value: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Unused),
            1 => Some(Self::Small { bin: value }),
            2 if value > 0 => Some(Self::LargeHead { chunks: value }),
            3 => Some(Self::LargeBody),
            _ => None,
        }
    }
}

/// Chunk kinds plus an index of maximal runs of unused chunks.
///
/// Runs are picked first-fit by chunk index, so a given sequence of
/// requests always lands on the same chunks.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChunkTable {
    kinds: Vec<ChunkKind>,
    free_runs: BTreeMap<usize, usize>,
}

impl ChunkTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the run index from a persisted kind list.
    pub(crate) fn from_kinds(kinds: Vec<ChunkKind>) -> Self {
        let mut table = Self {
            kinds,
            free_runs: BTreeMap::new(),
        };
        let mut run_start = None;
        for (index, kind) in table.kinds.iter().enumerate() {
            match (kind, run_start) {
                (ChunkKind::Unused, None) => run_start = Some(index),
                (ChunkKind::Unused, Some(_)) => {}
                (_, Some(start)) => {
                    table.free_runs.insert(start, index - start);
                    run_start = None;
                }
                (_, None) => {}
            }
        }
        if let Some(start) = run_start {
            table.free_runs.insert(start, table.kinds.len() - start);
        }
        table
    }

    pub(crate) fn len(&self) -> usize {
        self.kinds.len()
    }

    pub(crate) fn kinds(&self) -> &[ChunkKind] {
        &self.kinds
    }

    pub(crate) fn kind(&self, chunk: usize) -> Option<ChunkKind> {
        self.kinds.get(chunk).copied()
    }

    #[cfg(test)]
    pub(crate) fn unused_chunks(&self) -> usize {
        self.free_runs.values().sum()
    }

    /// Length of the unused run touching the end of the table, if any.
    pub(crate) fn trailing_unused(&self) -> usize {
        self.free_runs
            .iter()
            .next_back()
            .filter(|(&start, &len)| start + len == self.kinds.len())
            .map_or(0, |(_, &len)| len)
    }

    /// Appends `count` unused chunks.
    pub(crate) fn grow(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let start = self.kinds.len();
        self.kinds.resize(start + count, ChunkKind::Unused);
        self.insert_run(start, count);
    }

    /// Claims the first run of at least `count` unused chunks and tags it
    /// with `kind` (a large object's body chunks become `LargeBody`).
    pub(crate) fn claim(&mut self, count: usize, kind: ChunkKind) -> Option<usize> {
        let (&start, &len) = self.free_runs.iter().find(|(_, &len)| len >= count)?;
        self.free_runs.remove(&start);
        if len > count {
            self.free_runs.insert(start + count, len - count);
        }

        self.kinds[start] = kind;
        for chunk in &mut self.kinds[start + 1..start + count] {
            *chunk = if matches!(kind, ChunkKind::LargeHead { .. }) {
                ChunkKind::LargeBody
            } else {
                kind
            };
        }
        Some(start)
    }

    /// Returns the large object starting at `head` to the unused pool.
    ///
    /// Returns its length in chunks, or `None` if `head` is not the head of
    /// a large object.
    pub(crate) fn release_large(&mut self, head: usize) -> Option<usize> {
        let ChunkKind::LargeHead { chunks } = self.kind(head)? else {
            return None;
        };
        let count = chunks as usize;
        for chunk in &mut self.kinds[head..head + count] {
            *chunk = ChunkKind::Unused;
        }
        self.insert_run(head, count);
        Some(count)
    }

    fn insert_run(&mut self, mut start: usize, mut len: usize) {
        if let Some((&prev_start, &prev_len)) = self.free_runs.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free_runs.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free_runs.remove(&(start + len)) {
            len += next_len;
        }
        self.free_runs.insert(start, len);
    }

    #[cfg(test)]
    pub(crate) fn runs(&self) -> Vec<(usize, usize)> {
        self.free_runs.iter().map(|(&s, &l)| (s, l)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn large(chunks: u32) -> ChunkKind {
        ChunkKind::LargeHead { chunks }
    }

    #[test]
    fn grow_merges_with_trailing_run() {
        let mut t = ChunkTable::new();
        t.grow(2);
        t.grow(3);
        assert_eq!(t.runs(), [(0, 5)]);
        assert_eq!(t.trailing_unused(), 5);
    }

    #[test]
    fn first_fit_claim() {
        let mut t = ChunkTable::new();
        t.grow(10);
        assert_eq!(t.claim(2, large(2)), Some(0));
        assert_eq!(t.claim(1, ChunkKind::Small { bin: 3 }), Some(2));
        assert_eq!(t.claim(3, large(3)), Some(3));
        assert_eq!(t.runs(), [(6, 4)]);

        assert_eq!(t.kind(0), Some(large(2)));
        assert_eq!(t.kind(1), Some(ChunkKind::LargeBody));
        assert_eq!(t.kind(2), Some(ChunkKind::Small { bin: 3 }));
        assert_eq!(t.claim(5, large(5)), None);
    }

    #[test]
    fn release_coalesces_neighbours() {
        let mut t = ChunkTable::new();
        t.grow(6);
        t.claim(2, large(2)).unwrap();
        t.claim(2, large(2)).unwrap();
        t.claim(2, large(2)).unwrap();
        assert!(t.runs().is_empty());

        assert_eq!(t.release_large(0), Some(2));
        assert_eq!(t.release_large(4), Some(2));
        assert_eq!(t.runs(), [(0, 2), (4, 2)]);
        assert_eq!(t.release_large(2), Some(2));
        assert_eq!(t.runs(), [(0, 6)]);
    }

    #[test]
    fn release_rejects_non_heads() {
        let mut t = ChunkTable::new();
        t.grow(4);
        t.claim(2, large(2)).unwrap();
        t.claim(1, ChunkKind::Small { bin: 0 }).unwrap();

        assert_eq!(t.release_large(1), None);
        assert_eq!(t.release_large(2), None);
        assert_eq!(t.release_large(3), None);
        assert_eq!(t.release_large(9), None);
    }

    #[test]
    fn rebuild_from_kinds() {
        let kinds = vec![
            ChunkKind::Unused,
            ChunkKind::Unused,
            ChunkKind::Small { bin: 1 },
            ChunkKind::Unused,
            large(2),
            ChunkKind::LargeBody,
            ChunkKind::Unused,
        ];
        let t = ChunkTable::from_kinds(kinds);
        assert_eq!(t.runs(), [(0, 2), (3, 1), (6, 1)]);
        assert_eq!(t.unused_chunks(), 4);
        assert_eq!(t.trailing_unused(), 1);
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            ChunkKind::Unused,
            ChunkKind::Small { bin: 7 },
            large(3),
            ChunkKind::LargeBody,
        ] {
            let (tag, value) = kind.tag();
            assert_eq!(ChunkKind::from_tag(tag, value), Some(kind));
        }
        assert_eq!(ChunkKind::from_tag(9, 0), None);
        assert_eq!(ChunkKind::from_tag(2, 0), None);
    }
}
