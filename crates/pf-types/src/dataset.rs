use serde::{Deserialize, Serialize};

/// Immutable handle to a training frame held by the storage layer.
///
/// Jobs carry a clone of the handle; the frame itself is never touched here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetHandle {
    pub key: String,
    pub rows: u64,
    pub columns: u32,
    /// Fraction of cells that are not missing, in `[0, 1]`.
    pub non_na_rate: f64,
}

impl DatasetHandle {
    pub fn new(key: impl Into<String>, rows: u64, columns: u32) -> Self {
        Self {
            key: key.into(),
            rows,
            columns,
            non_na_rate: 1.0,
        }
    }

    pub fn with_non_na_rate(mut self, rate: f64) -> Self {
        self.non_na_rate = rate.clamp(0.0, 1.0);
        self
    }
}

impl std::fmt::Display for DatasetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}x{})", self.key, self.rows, self.columns)
    }
}
