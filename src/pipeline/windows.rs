//! Trajectory buffer: fixed-capacity ring of signed per-poll energy
//!
//! Each poll writes `instant_energy * direction_sign`. The absolute sum of
//! the ring (trajectory consistency) is large when recent polls agree in
//! sign and small when they cancel out.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryBuffer {
    values: Vec<f64>,
    index: usize,
    capacity: usize,
}

impl TrajectoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: Vec::with_capacity(capacity),
            index: 0,
            capacity,
        }
    }

    /// Rebuild from persisted ring layout
    ///
    /// Inconsistent input (too many values, out-of-range index) is
    /// normalised rather than rejected.
    pub fn from_parts(values: Vec<f64>, index: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        if values.len() <= capacity && (values.len() == capacity || index == values.len() % capacity) {
            return Self {
                values,
                index: index % capacity,
                capacity,
            };
        }

        let mut buffer = Self::new(capacity);
        let start = if values.len() >= capacity && index < values.len() { index } else { 0 };
        for i in 0..values.len() {
            buffer.push(values[(start + i) % values.len()]);
        }
        buffer
    }

    /// Same contents, most recent `capacity` entries kept, in a ring of the new size
    pub fn resized(&self, capacity: usize) -> Self {
        if capacity.max(1) == self.capacity {
            return self.clone();
        }
        let mut buffer = Self::new(capacity);
        for value in self.chronological() {
            buffer.push(value);
        }
        buffer
    }

    /// Write the next value, overwriting the oldest once full
    pub fn push(&mut self, value: f64) {
        if self.values.len() < self.capacity {
            self.values.push(value);
        } else {
            self.values[self.index] = value;
        }
        self.index = (self.index + 1) % self.capacity;
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    /// |sum| of the ring
    pub fn consistency(&self) -> f64 {
        self.sum().abs()
    }

    /// Raw ring layout (write order is not preserved once full)
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Entries oldest first
    pub fn chronological(&self) -> Vec<f64> {
        if self.values.len() < self.capacity {
            return self.values.clone();
        }
        let (newer, older) = self.values.split_at(self.index);
        older.iter().chain(newer.iter()).copied().collect()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
