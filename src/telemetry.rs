//! Run-scoped write accounting.
//!
//! Every write attempt is classified by exactly one category (which tag kinds
//! it carried) and one route. Unique-touched sets count each file at most
//! once per category no matter how many strategies were attempted before one
//! succeeded. The grand total per category excludes fallback counts so a
//! file is not counted under both its failed-native and successful-fallback
//! attempt.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::model::FileRole;
use crate::tags::TagSet;

/// Which tag kinds a write attempt carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    DateOnly,
    GpsOnly,
    Combined,
}

impl Category {
    /// Classify a TagSet. Returns `None` for an empty set (nothing to write).
    pub fn of(tags: &TagSet) -> Option<Self> {
        match (tags.has_date(), tags.has_gps()) {
            (true, true) => Some(Category::Combined),
            (true, false) => Some(Category::DateOnly),
            (false, true) => Some(Category::GpsOnly),
            (false, false) => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Category::DateOnly => "date",
            Category::GpsOnly => "gps",
            Category::Combined => "date+gps",
        }
    }

    fn writes_date(&self) -> bool {
        matches!(self, Category::DateOnly | Category::Combined)
    }

    fn writes_gps(&self) -> bool {
        matches!(self, Category::GpsOnly | Category::Combined)
    }
}

/// How a write was performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Route {
    /// In-process binary patch.
    Native,
    /// External tool, first-choice path for this file.
    ToolDirect,
    /// External tool, used only because a native attempt failed first.
    ToolFallback,
}

impl Route {
    pub fn label(&self) -> &'static str {
        match self {
            Route::Native => "native",
            Route::ToolDirect => "tool-direct",
            Route::ToolFallback => "tool-fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    successes: u64,
    failures: u64,
    elapsed: Duration,
}

#[derive(Debug, Default)]
struct UniqueSet {
    primary: HashSet<String>,
    secondary: HashSet<String>,
    unsplit: HashSet<String>,
}

impl UniqueSet {
    // Keys are absolute so the same file reached through a relative and an
    // absolute path counts once.
    fn insert(&mut self, path: &Path, role: FileRole) {
        let key = std::path::absolute(path)
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .to_string();
        match role {
            FileRole::Primary => self.primary.insert(key),
            FileRole::Secondary => self.secondary.insert(key),
            FileRole::Unknown => self.unsplit.insert(key),
        };
    }

    fn len(&self) -> usize {
        self.primary.len() + self.secondary.len() + self.unsplit.len()
    }
}

/// Run-wide counters, reset at run start and drained at run end.
#[derive(Debug, Default)]
pub struct TelemetryState {
    buckets: BTreeMap<(Category, Route), Bucket>,
    touched: UniqueSet,
    touched_date: UniqueSet,
    touched_gps: UniqueSet,
}

impl TelemetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one write attempt.
    pub fn record(&mut self, category: Category, route: Route, success: bool, elapsed: Duration) {
        let bucket = self.buckets.entry((category, route)).or_default();
        if success {
            bucket.successes += 1;
        } else {
            bucket.failures += 1;
        }
        bucket.elapsed += elapsed;
    }

    /// Mark a file as successfully touched under a category. Idempotent per
    /// file and category.
    pub fn mark_touched(&mut self, path: &Path, role: FileRole, category: Category) {
        self.touched.insert(path, role);
        if category.writes_date() {
            self.touched_date.insert(path, role);
        }
        if category.writes_gps() {
            self.touched_gps.insert(path, role);
        }
    }

    pub fn unique_touched(&self) -> usize {
        self.touched.len()
    }

    pub fn unique_with_date(&self) -> usize {
        self.touched_date.len()
    }

    pub fn unique_with_gps(&self) -> usize {
        self.touched_gps.len()
    }

    /// Raw attempt count (successes + failures) for attempts that carried a
    /// date, across all routes.
    pub fn date_attempts(&self) -> u64 {
        self.attempts(|c| c.writes_date())
    }

    /// Raw attempt count for attempts that carried GPS, across all routes.
    pub fn gps_attempts(&self) -> u64 {
        self.attempts(|c| c.writes_gps())
    }

    fn attempts(&self, pred: impl Fn(&Category) -> bool) -> u64 {
        self.buckets
            .iter()
            .filter(|((c, _), _)| pred(c))
            .map(|(_, b)| b.successes + b.failures)
            .sum()
    }

    fn bucket(&self, category: Category, route: Route) -> Bucket {
        self.buckets
            .get(&(category, route))
            .copied()
            .unwrap_or_default()
    }

    /// Successes for a category across non-fallback routes. Fallback is
    /// excluded so a file that failed natively and then succeeded through the
    /// tool is not counted twice.
    pub fn successes_excluding_fallback(&self, category: Category) -> u64 {
        self.bucket(category, Route::Native).successes
            + self.bucket(category, Route::ToolDirect).successes
    }

    /// Log one block per category with per-route sub-totals.
    pub fn dump(&self) {
        for category in [Category::DateOnly, Category::GpsOnly, Category::Combined] {
            let routes = [Route::Native, Route::ToolDirect, Route::ToolFallback];
            if routes.iter().all(|r| {
                let b = self.bucket(category, *r);
                b.successes + b.failures == 0
            }) {
                continue;
            }
            log::info!("{} writes:", category.label());
            for route in routes {
                let b = self.bucket(category, route);
                if b.successes + b.failures == 0 {
                    continue;
                }
                log::info!(
                    "  {}: {} ok, {} failed, {:.1}s",
                    route.label(),
                    b.successes,
                    b.failures,
                    b.elapsed.as_secs_f64()
                );
            }
            log::info!(
                "  total: {} (fallback excluded)",
                self.successes_excluding_fallback(category)
            );
        }
        log::info!(
            "unique files: {} touched, {} with date, {} with gps",
            self.unique_touched(),
            self.unique_with_date(),
            self.unique_with_gps()
        );
    }
}

/// Split one batch call's elapsed time across categories in proportion to
/// each category's share of entries. There is no per-entry timer inside a
/// batched tool call; this is a documented approximation.
pub fn proportional_share(elapsed: Duration, category_count: usize, total: usize) -> Duration {
    if total == 0 {
        return Duration::ZERO;
    }
    elapsed.mul_f64(category_count as f64 / total as f64)
}
