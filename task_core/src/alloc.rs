use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryCategory {
    JobRecords,
    DependencyLinks,
    HandleTable,
    TaskPayload,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 4] = [
        MemoryCategory::JobRecords,
        MemoryCategory::DependencyLinks,
        MemoryCategory::HandleTable,
        MemoryCategory::TaskPayload,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryCategory::JobRecords => "job_records",
            MemoryCategory::DependencyLinks => "dependency_links",
            MemoryCategory::HandleTable => "handle_table",
            MemoryCategory::TaskPayload => "task_payload",
        }
    }

    fn index(self) -> usize {
        match self {
            MemoryCategory::JobRecords => 0,
            MemoryCategory::DependencyLinks => 1,
            MemoryCategory::HandleTable => 2,
            MemoryCategory::TaskPayload => 3,
        }
    }
}

impl fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{category} allocation of {requested} bytes refused ({live} bytes live, limit {limit})")]
pub struct AllocError {
    pub category: MemoryCategory,
    pub requested: usize,
    pub live: usize,
    pub limit: usize,
}

pub trait CategoryAllocator: Send + Sync {
    fn allocate(&self, category: MemoryCategory, bytes: usize) -> Result<(), AllocError>;

    fn reallocate(
        &self,
        category: MemoryCategory,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<(), AllocError> {
        if new_bytes > old_bytes {
            self.allocate(category, new_bytes - old_bytes)
        } else {
            self.free(category, old_bytes - new_bytes);
            Ok(())
        }
    }

    fn free(&self, category: MemoryCategory, bytes: usize);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CategoryStats {
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub allocations: usize,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStats {
    pub job_records: CategoryStats,
    pub dependency_links: CategoryStats,
    pub handle_table: CategoryStats,
    pub task_payload: CategoryStats,
}

impl MemoryStats {
    pub fn get(&self, category: MemoryCategory) -> CategoryStats {
        match category {
            MemoryCategory::JobRecords => self.job_records,
            MemoryCategory::DependencyLinks => self.dependency_links,
            MemoryCategory::HandleTable => self.handle_table,
            MemoryCategory::TaskPayload => self.task_payload,
        }
    }

    pub fn total_live_bytes(&self) -> usize {
        MemoryCategory::ALL
            .iter()
            .map(|category| self.get(*category).live_bytes)
            .sum()
    }
}

#[derive(Default)]
struct CategoryCounters {
    live: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicUsize,
}

pub struct CountingAllocator {
    limit: Option<usize>,
    total: AtomicUsize,
    counters: [CategoryCounters; 4],
}

impl Default for CountingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self {
            limit: None,
            total: AtomicUsize::new(0),
            counters: Default::default(),
        }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let snapshot = |category: MemoryCategory| {
            let counters = &self.counters[category.index()];
            CategoryStats {
                live_bytes: counters.live.load(Ordering::Relaxed),
                peak_bytes: counters.peak.load(Ordering::Relaxed),
                allocations: counters.allocations.load(Ordering::Relaxed),
            }
        };
        MemoryStats {
            job_records: snapshot(MemoryCategory::JobRecords),
            dependency_links: snapshot(MemoryCategory::DependencyLinks),
            handle_table: snapshot(MemoryCategory::HandleTable),
            task_payload: snapshot(MemoryCategory::TaskPayload),
        }
    }
}

impl CategoryAllocator for CountingAllocator {
    fn allocate(&self, category: MemoryCategory, bytes: usize) -> Result<(), AllocError> {
        let previous = self.total.fetch_add(bytes, Ordering::AcqRel);
        if let Some(limit) = self.limit {
            if previous.saturating_add(bytes) > limit {
                self.total.fetch_sub(bytes, Ordering::AcqRel);
                return Err(AllocError {
                    category,
                    requested: bytes,
                    live: previous,
                    limit,
                });
            }
        }
        let counters = &self.counters[category.index()];
        let live = counters.live.fetch_add(bytes, Ordering::AcqRel) + bytes;
        counters.peak.fetch_max(live, Ordering::AcqRel);
        counters.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn free(&self, category: MemoryCategory, bytes: usize) {
        let counters = &self.counters[category.index()];
        let released = counters
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                Some(live.saturating_sub(bytes))
            })
            .map(|live| live.min(bytes))
            .unwrap_or(0);
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                Some(total.saturating_sub(released))
            })
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_live_and_peak_per_category() {
        let allocator = CountingAllocator::new();
        allocator
            .allocate(MemoryCategory::JobRecords, 128)
            .expect("allocate");
        allocator
            .allocate(MemoryCategory::JobRecords, 64)
            .expect("allocate");
        allocator.free(MemoryCategory::JobRecords, 128);
        allocator
            .allocate(MemoryCategory::TaskPayload, 10)
            .expect("allocate");

        let stats = allocator.stats();
        assert_eq!(stats.job_records.live_bytes, 64);
        assert_eq!(stats.job_records.peak_bytes, 192);
        assert_eq!(stats.job_records.allocations, 2);
        assert_eq!(stats.task_payload.live_bytes, 10);
        assert_eq!(stats.total_live_bytes(), 74);
    }

    #[test]
    fn limit_refuses_and_rolls_back() {
        let allocator = CountingAllocator::with_limit(100);
        allocator
            .allocate(MemoryCategory::HandleTable, 80)
            .expect("allocate");
        let err = allocator
            .allocate(MemoryCategory::TaskPayload, 40)
            .expect_err("over limit");
        assert_eq!(err.category, MemoryCategory::TaskPayload);
        assert_eq!(err.live, 80);
        assert_eq!(allocator.stats().total_live_bytes(), 80);

        allocator.free(MemoryCategory::HandleTable, 80);
        allocator
            .allocate(MemoryCategory::TaskPayload, 40)
            .expect("fits after free");
    }

    #[test]
    fn reallocate_grows_and_shrinks() {
        let allocator = CountingAllocator::new();
        allocator
            .reallocate(MemoryCategory::HandleTable, 0, 256)
            .expect("grow");
        allocator
            .reallocate(MemoryCategory::HandleTable, 256, 64)
            .expect("shrink");
        assert_eq!(allocator.stats().handle_table.live_bytes, 64);
        assert_eq!(allocator.stats().handle_table.peak_bytes, 256);
    }

    #[test]
    fn free_never_underflows() {
        let allocator = CountingAllocator::new();
        allocator.free(MemoryCategory::DependencyLinks, 32);
        assert_eq!(allocator.stats().dependency_links.live_bytes, 0);
        assert_eq!(allocator.stats().total_live_bytes(), 0);
    }
}
