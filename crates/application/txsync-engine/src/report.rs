use serde::Serialize;
use txsync_core::{Address, Category, TimeRange, Timestamp};

use crate::RemoteError;

/// Remote failure that stopped a category before its window was covered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub window: TimeRange,
    pub error: RemoteError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryReport {
    pub category: Category,
    pub gaps_found: usize,
    pub gaps_completed: usize,
    pub batches_committed: usize,
    pub records_stored: usize,
    pub parents_fetched: usize,
    pub failure: Option<SyncFailure>,
}

impl CategoryReport {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            gaps_found: 0,
            gaps_completed: 0,
            batches_committed: 0,
            records_stored: 0,
            parents_fetched: 0,
            failure: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub address: Address,
    pub start: Timestamp,
    pub end: Timestamp,
    pub categories: Vec<CategoryReport>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.categories.iter().all(CategoryReport::is_complete)
    }

    pub fn records_stored(&self) -> usize {
        self.categories.iter().map(|c| c.records_stored).sum()
    }

    pub fn category(&self, category: Category) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.category == category)
    }
}
