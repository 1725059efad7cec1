//! Double-buffer bookkeeping: every versioned quantity owns two rows per
//! node plus a per-node label selecting the current one. All slot selection
//! funnels through [`Slots`] so that commit/rollback stays a single label
//! operation, never a data copy.

/// Per-node current/stored slot labels.
#[derive(Debug, Clone)]
pub(crate) struct Slots {
    current: Vec<u8>,
    stored: Vec<u8>,
}

impl Slots {
    pub fn new(node_count: usize) -> Self {
        Self {
            current: vec![0; node_count],
            stored: vec![0; node_count],
        }
    }

    #[inline]
    pub fn current(&self, node: usize) -> usize {
        self.current[node] as usize
    }

    /// Switch the node's current slot before a rewrite, returning the new
    /// slot. Callers rewrite the entire slot afterwards.
    #[inline]
    pub fn flip(&mut self, node: usize) -> usize {
        self.current[node] ^= 1;
        self.current[node] as usize
    }

    pub fn commit(&mut self) {
        self.stored.copy_from_slice(&self.current);
    }

    pub fn rollback(&mut self) {
        std::mem::swap(&mut self.current, &mut self.stored);
    }
}

/// Two owned rows per node; rows are addressed as `node * 2 + slot`.
#[derive(Debug, Clone)]
pub(crate) struct Arena<T> {
    rows: Vec<Vec<T>>,
}

impl<T: Clone + Default> Arena<T> {
    pub fn new(node_count: usize, row_len: usize) -> Self {
        Self {
            rows: vec![vec![T::default(); row_len]; node_count * 2],
        }
    }

    #[inline]
    pub fn row(&self, node: usize, slot: usize) -> &[T] {
        &self.rows[node * 2 + slot]
    }

    #[inline]
    pub fn row_mut(&mut self, node: usize, slot: usize) -> &mut [T] {
        &mut self.rows[node * 2 + slot]
    }

    /// One writable row plus one read-only row from a different node.
    pub fn row_mut_read(
        &mut self,
        w: (usize, usize),
        r: (usize, usize),
    ) -> (&mut [T], &[T]) {
        split2(&mut self.rows, w.0 * 2 + w.1, r.0 * 2 + r.1)
    }

    /// One writable row plus two read-only rows; all three nodes distinct.
    pub fn row_mut_read2(
        &mut self,
        w: (usize, usize),
        r1: (usize, usize),
        r2: (usize, usize),
    ) -> (&mut [T], &[T], &[T]) {
        split3(
            &mut self.rows,
            w.0 * 2 + w.1,
            r1.0 * 2 + r1.1,
            r2.0 * 2 + r2.1,
        )
    }

    pub fn free(&mut self) {
        self.rows = Vec::new();
    }
}

/// Borrow row `w` mutably and row `r` shared; `w != r`.
fn split2<T>(rows: &mut [Vec<T>], w: usize, r: usize) -> (&mut [T], &[T]) {
    if w < r {
        let (head, tail) = rows.split_at_mut(r);
        (head[w].as_mut_slice(), tail[0].as_slice())
    } else {
        let (head, tail) = rows.split_at_mut(w);
        (tail[0].as_mut_slice(), head[r].as_slice())
    }
}

/// Borrow row `w` mutably and rows `r1`, `r2` shared; indices pairwise
/// distinct.
fn split3<T>(rows: &mut [Vec<T>], w: usize, r1: usize, r2: usize) -> (&mut [T], &[T], &[T]) {
    let mut sorted = [w, r1, r2];
    sorted.sort_unstable();
    let (head, rest) = rows.split_at_mut(sorted[1]);
    let (mid, tail) = rest.split_at_mut(sorted[2] - sorted[1]);

    // One disjoint element per sorted position, handed back by role.
    let mut elems = [
        Some(&mut head[sorted[0]]),
        Some(&mut mid[0]),
        Some(&mut tail[0]),
    ];
    let idx_of = |pos: usize| sorted.iter().position(|&s| s == pos).expect("distinct index");
    let ew = elems[idx_of(w)].take().expect("writable row");
    let er1 = elems[idx_of(r1)].take().expect("first read row");
    let er2 = elems[idx_of(r2)].take().expect("second read row");
    (ew.as_mut_slice(), er1.as_slice(), er2.as_slice())
}
