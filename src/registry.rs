use std::collections::HashMap;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    /// Only queued and running scans accept a stop request; a stopping scan
    /// is already on its way out.
    pub fn is_stoppable(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// Lifecycle record for one scan, serialized as-is on the control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub scan_id: String,
    /// The user-visible normalized list, before chunking.
    pub subnets: Vec<String>,
    pub status: ScanStatus,
    pub created_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<f64>,
    /// Work item count after chunking; the denominator for progress.
    pub total_subnets: usize,
    /// Address count over the prepared work list; the denominator for ETA.
    pub host_count: u64,
    pub subnets_done: usize,
    pub hosts_done: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanRecord {
    pub fn new(
        scan_id: String,
        subnets: Vec<String>,
        total_subnets: usize,
        host_count: u64,
        created_at: f64,
        estimated_seconds: Option<u64>,
    ) -> Self {
        Self {
            scan_id,
            subnets,
            status: ScanStatus::Queued,
            created_at,
            started_at: None,
            finished_at: None,
            total_subnets,
            host_count,
            subnets_done: 0,
            hosts_done: 0,
            duration_seconds: None,
            estimated_seconds,
            error: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum StopError {
    NotFound,
    NotStoppable,
}

struct ActiveScan {
    scan_id: String,
    cancel: CancellationToken,
}

/// All scan state for the process: records, the single active slot, and the
/// blended throughput average. The engine wraps this in one mutex; every
/// reader gets copies taken under it.
#[derive(Default)]
pub struct Registry {
    scans: HashMap<String, ScanRecord>,
    active: Option<ActiveScan>,
    avg_hosts_per_second: f64,
}

impl Registry {
    /// Insert a record and claim the active slot. Fails without side effects
    /// while another scan is queued, running, or stopping.
    pub fn admit(&mut self, record: ScanRecord, cancel: CancellationToken) -> bool {
        if self.active.is_some() {
            return false;
        }
        self.active = Some(ActiveScan {
            scan_id: record.scan_id.clone(),
            cancel,
        });
        self.scans.insert(record.scan_id.clone(), record);
        true
    }

    /// Flip a stoppable record to `stopping` and hand back the scan's
    /// cancellation token for the caller to fire outside the lock.
    pub fn request_stop(&mut self, scan_id: &str) -> Result<Option<CancellationToken>, StopError> {
        let record = self.scans.get_mut(scan_id).ok_or(StopError::NotFound)?;
        if !record.status.is_stoppable() {
            return Err(StopError::NotStoppable);
        }
        record.status = ScanStatus::Stopping;
        Ok(self
            .active
            .as_ref()
            .filter(|active| active.scan_id == scan_id)
            .map(|active| active.cancel.clone()))
    }

    pub fn active_token(&self) -> Option<CancellationToken> {
        self.active.as_ref().map(|active| active.cancel.clone())
    }

    pub fn mark_running(&mut self, scan_id: &str, started_at: f64) {
        if let Some(record) = self.scans.get_mut(scan_id) {
            record.started_at = Some(started_at);
            // a stop may already have raced in; don't resurrect it
            if record.status == ScanStatus::Queued {
                record.status = ScanStatus::Running;
            }
        }
    }

    /// One subnet finished: bump the counters. Counters are frozen once the
    /// record is terminal.
    pub fn record_progress(&mut self, scan_id: &str, hosts: u64) {
        if let Some(record) = self.scans.get_mut(scan_id) {
            if record.status.is_terminal() {
                return;
            }
            record.subnets_done += 1;
            record.hosts_done = record.hosts_done.saturating_add(hosts);
        }
    }

    /// The pool drained. `stopped` if a stop was requested or the token
    /// fired, `completed` otherwise; either way the observed throughput is
    /// absorbed and the active slot is cleared.
    pub fn finalize_drained(&mut self, scan_id: &str, finished_at: f64, cancelled: bool) {
        if let Some(record) = self.scans.get_mut(scan_id) {
            record.status = if cancelled || record.status == ScanStatus::Stopping {
                ScanStatus::Stopped
            } else {
                ScanStatus::Completed
            };
            record.finished_at = Some(finished_at);
            let started_at = record.started_at.unwrap_or(record.created_at);
            let duration = (finished_at - started_at).max(1.0);
            record.duration_seconds = Some(duration as u64);

            if record.host_count > 0 {
                self.avg_hosts_per_second =
                    (record.host_count as f64 / duration + self.avg_hosts_per_second) / 2.0;
            }
        }
        self.active = None;
    }

    pub fn finalize_failed(&mut self, scan_id: &str, finished_at: f64, error: String) {
        if let Some(record) = self.scans.get_mut(scan_id) {
            record.status = ScanStatus::Failed;
            record.finished_at = Some(finished_at);
            record.error = Some(error);
        }
        self.active = None;
    }

    /// ETA from the blended average, floored to whole seconds. None until a
    /// first scan has completed.
    pub fn estimate_seconds(&self, hosts: u64) -> Option<u64> {
        if self.avg_hosts_per_second <= 0.0 {
            return None;
        }
        Some((hosts as f64 / self.avg_hosts_per_second) as u64)
    }

    pub fn get(&self, scan_id: &str) -> Option<ScanRecord> {
        self.scans.get(scan_id).cloned()
    }

    /// Snapshot of every record, newest first.
    pub fn list(&self) -> Vec<ScanRecord> {
        let mut records: Vec<ScanRecord> = self.scans.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.total_cmp(&a.created_at));
        records
    }
}
