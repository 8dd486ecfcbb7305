//! Active-row compaction.
//!
//! After every layer only rows with at least one positive activation stay
//! active. The surviving indices are gathered in ascending order so the next
//! kernel launch touches live rows only.

/// Write the indices of rows with nonzero length into `rows_out`, in order.
///
/// Returns the number of active rows. `rows_out` must be at least as long as
/// `row_len`.
pub fn compact_rows(row_len: &[i32], rows_out: &mut [i32]) -> usize {
    debug_assert!(rows_out.len() >= row_len.len());
    let mut count = 0;
    for (i, &len) in row_len.iter().enumerate() {
        if len > 0 {
            rows_out[count] = i as i32;
            count += 1;
        }
    }
    count
}

/// Ordered active-row indices with their row lengths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveRowSet {
    rows: Vec<i32>,
    row_len: Vec<i32>,
}

impl ActiveRowSet {
    pub fn with_capacity(rows: usize) -> Self {
        Self { rows: Vec::with_capacity(rows), row_len: vec![0; rows] }
    }

    /// Overwrite this set from a full row-length array.
    pub fn compact_from(&mut self, row_len: &[i32]) -> usize {
        self.row_len.clear();
        self.row_len.extend_from_slice(row_len);
        self.rows.clear();
        self.rows
            .extend(row_len.iter().enumerate().filter(|(_, len)| **len > 0).map(|(i, _)| i as i32));
        self.rows.len()
    }

    /// Active row indices, ascending.
    pub fn rows(&self) -> &[i32] {
        &self.rows
    }

    /// Row lengths of every row of the shard.
    pub fn row_len(&self) -> &[i32] {
        &self.row_len
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Ping-pong pair of active-row sets plus the per-layer count history.
#[derive(Debug, Clone, Default)]
pub struct RowTracker {
    sets: [ActiveRowSet; 2],
    current: usize,
    history: Vec<usize>,
}

impl RowTracker {
    pub fn new(rows: usize) -> Self {
        Self {
            sets: [ActiveRowSet::with_capacity(rows), ActiveRowSet::with_capacity(rows)],
            current: 0,
            history: Vec::new(),
        }
    }

    /// Start a run from the input row lengths.
    pub fn reset(&mut self, row_len: &[i32]) -> usize {
        self.current = 0;
        self.history.clear();
        let count = self.sets[0].compact_from(row_len);
        self.history.push(count);
        count
    }

    /// Compact the next set from a layer's output row lengths and flip.
    pub fn advance(&mut self, row_len: &[i32]) -> usize {
        let next = 1 - self.current;
        let count = self.sets[next].compact_from(row_len);
        self.current = next;
        self.record_count(count);
        count
    }

    /// Record a count computed elsewhere (e.g. on the device).
    pub fn record_count(&mut self, count: usize) {
        if let Some(&prev) = self.history.last() {
            debug_assert!(count <= prev, "active rows grew from {prev} to {count}");
            if count > prev {
                tracing::warn!("active rows grew from {} to {}", prev, count);
            }
        }
        self.history.push(count);
    }

    /// Replace the history wholesale, e.g. from a device-side buffer.
    pub fn set_history(&mut self, history: Vec<usize>) {
        self.history = history;
    }

    /// The set feeding the next stage.
    pub fn current(&self) -> &ActiveRowSet {
        &self.sets[self.current]
    }

    /// Active count before layer 0 followed by the count after every layer.
    pub fn history(&self) -> &[usize] {
        &self.history
    }

    /// Whether the recorded counts never grow.
    pub fn is_non_increasing(&self) -> bool {
        self.history.windows(2).all(|w| w[1] <= w[0])
    }
}
