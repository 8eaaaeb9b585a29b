//! Progress reporting for the synchronizers.
//!
//! Progress events are debounced: state changes only schedule a report, and the report fires
//! once per interval through [`ProgressThrottle`], which the sync loops poll in `select!`.

use crate::error::ValidationError;

use std::time::Duration;
use tokio::time::Instant;

/// Header sync progress. Percentages are rounded to one decimal.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadersSyncProgress {
    pub confirmed_progress: f64,
    pub total_progress: f64,
    /// Headers in the longest contiguous chain
    pub confirmed_synced_count: u32,
    /// Confirmed headers plus headers waiting in orphan chunks
    pub total_synced_count: u32,
    pub total_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionsSyncProgress {
    pub progress: f64,
    pub synced_blocks_count: u32,
    pub total_blocks_count: u32,
    pub transactions_count: usize,
}

/// Normalized progress in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncProgress {
    pub confirmed: f64,
    pub unconfirmed: f64,
    pub total: f64,
}

impl SyncProgress {
    pub fn from_counts(
        confirmed_synced: u32,
        total_synced: u32,
        total: u32,
    ) -> Result<Self, ValidationError> {
        if total_synced > total {
            return Err(ValidationError::SyncedBeyondTotal {
                synced: total_synced,
                total,
            });
        }
        if total == 0 {
            return Ok(Self {
                confirmed: 1.0,
                unconfirmed: 0.0,
                total: 1.0,
            });
        }
        let total = f64::from(total);
        Ok(Self {
            confirmed: f64::from(confirmed_synced) / total,
            unconfirmed: f64::from(total_synced.saturating_sub(confirmed_synced)) / total,
            total: f64::from(total_synced) / total,
        })
    }
}

impl HeadersSyncProgress {
    pub fn from_counts(
        confirmed_synced_count: u32,
        total_synced_count: u32,
        total_count: u32,
    ) -> Result<Self, ValidationError> {
        if total_synced_count > total_count {
            return Err(ValidationError::SyncedBeyondTotal {
                synced: total_synced_count,
                total: total_count,
            });
        }
        Ok(Self {
            confirmed_progress: percent(confirmed_synced_count, total_count),
            total_progress: percent(total_synced_count, total_count),
            confirmed_synced_count,
            total_synced_count,
            total_count,
        })
    }
}

/// Percentage rounded to one decimal. An empty range counts as complete.
pub fn percent(count: u32, total: u32) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (f64::from(count) / f64::from(total) * 1000.0).round() / 10.0
}

/// Debounce for progress reports
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    deadline: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// Requests a report. Requests made before the pending one fires are merged into it.
    pub fn schedule(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.interval);
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    /// Resolves when the scheduled report is due. Never resolves when nothing is scheduled.
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_progress_percentages() {
        let progress = HeadersSyncProgress::from_counts(4, 4, 1000).unwrap();
        assert_eq!(progress.confirmed_progress, 0.4);
        assert_eq!(progress.total_progress, 0.4);

        let progress = HeadersSyncProgress::from_counts(100, 250, 1000).unwrap();
        assert_eq!(progress.confirmed_progress, 10.0);
        assert_eq!(progress.total_progress, 25.0);
    }

    #[test]
    fn synced_beyond_total_is_rejected() {
        let err = HeadersSyncProgress::from_counts(5, 5, 4).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Synced headers count 5 is greater than total headers count 4."
        );
        assert!(SyncProgress::from_counts(1, 5, 4).is_err());
    }

    #[test]
    fn normalized_progress_splits_confirmed_and_orphaned() {
        let progress = SyncProgress::from_counts(50, 80, 100).unwrap();
        assert_eq!(progress.confirmed, 0.5);
        assert!((progress.unconfirmed - 0.3).abs() < 1e-9);
        assert_eq!(progress.total, 0.8);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_merges_requests() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(1000));
        assert!(!throttle.is_scheduled());

        throttle.schedule();
        let started = Instant::now();
        tokio::time::advance(Duration::from_millis(400)).await;
        throttle.schedule();
        throttle.wait().await;

        assert_eq!(started.elapsed(), Duration::from_millis(1000));
        throttle.clear();
        assert!(!throttle.is_scheduled());
    }
}
