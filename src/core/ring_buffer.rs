//! Fixed-capacity sample history with a streaming average.
//!
//! Sessions keep the intervals between their accepted shares here; the VarDiff
//! sweep averages them. Once full, each append overwrites the oldest sample.

#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<f64>,
    capacity: usize,
    cursor: usize,
    full: bool,
}

impl RingBuffer {
    /// Capacity is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
            full: false,
        }
    }

    pub fn append(&mut self, sample: f64) {
        if self.full {
            self.data[self.cursor] = sample;
            self.cursor = (self.cursor + 1) % self.capacity;
        } else {
            self.data.push(sample);
            self.cursor += 1;
            if self.data.len() == self.capacity {
                self.cursor = 0;
                self.full = true;
            }
        }
    }

    /// Mean of the stored samples, plus `extra` when given.
    ///
    /// The divisor is the number of samples actually stored (not the
    /// capacity) plus one for the extra sample. Returns `None` when there is
    /// nothing to average.
    pub fn average(&self, extra: Option<f64>) -> Option<f64> {
        let count = self.len() + usize::from(extra.is_some());
        if count == 0 {
            return None;
        }
        let sum: f64 = self.data.iter().sum::<f64>() + extra.unwrap_or(0.0);
        Some(sum / count as f64)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.cursor = 0;
        self.full = false;
    }
}
