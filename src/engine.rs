use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    config::Config,
    database::Database,
    epoch_now,
    probe::Pinger,
    registry::{Registry, ScanRecord, StopError},
    scan::{self, ScanHooks, ScanOptions},
    subnets::{self, WorkItem},
};

/// Everything the control plane needs, behind one value: configuration, the
/// probe (which owns the document-store handle), and the mutex-guarded scan
/// registry. Handlers share it as `Arc<Engine>`; there are no globals.
pub struct Engine {
    pub config: Config,
    pinger: Arc<Pinger>,
    registry: Mutex<Registry>,
}

pub struct StartScanRequest {
    pub subnets: Vec<String>,
    pub scan_id: Option<String>,
    pub max_active: Option<usize>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StartScanError {
    /// Nothing scannable was left after normalization and chunking.
    NoSubnets,
    /// At least one candidate did not parse; carries the offenders.
    InvalidSubnets(Vec<String>),
    AlreadyRunning,
}

impl Engine {
    pub async fn connect(config: Config) -> eyre::Result<Arc<Self>> {
        let database = Database::connect(&config.mongodb_uri).await?;
        Ok(Self::new(config, database))
    }

    pub fn new(config: Config, database: Database) -> Arc<Self> {
        let pinger = Arc::new(Pinger::new(&config, database));
        Arc::new(Self {
            config,
            pinger,
            registry: Mutex::new(Registry::default()),
        })
    }

    /// Validate, normalize, and admit a scan, then launch its background
    /// task. Returns the freshly queued record. Never blocks on scan work.
    pub fn start_scan(
        self: Arc<Self>,
        request: StartScanRequest,
    ) -> Result<ScanRecord, StartScanError> {
        let (normalized, invalid) = subnets::parse_and_collapse(&request.subnets);
        if !invalid.is_empty() {
            return Err(StartScanError::InvalidSubnets(invalid));
        }
        if normalized.is_empty() {
            return Err(StartScanError::NoSubnets);
        }
        let (work_items, host_count) =
            subnets::prepare(&normalized, self.config.scan.chunk_prefix_v4);
        if work_items.is_empty() {
            return Err(StartScanError::NoSubnets);
        }

        let max_active = self.config.resolve_max_active(request.max_active);
        let cancel = CancellationToken::new();

        let record = {
            let mut registry = self.registry.lock();
            let scan_id = request
                .scan_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let record = ScanRecord::new(
                scan_id,
                normalized.iter().map(ToString::to_string).collect(),
                work_items.len(),
                host_count,
                epoch_now(),
                registry.estimate_seconds(host_count),
            );
            if !registry.admit(record.clone(), cancel.clone()) {
                return Err(StartScanError::AlreadyRunning);
            }
            record
        };

        info!(
            "Scan {} admitted: subnets={}, workItems={}, hosts={}, maxActive={}",
            record.scan_id,
            record.subnets.len(),
            record.total_subnets,
            record.host_count,
            max_active,
        );

        let scan_id = record.scan_id.clone();
        tokio::spawn(async move {
            self.run_scan(scan_id, work_items, cancel, max_active).await;
        });

        Ok(record)
    }

    /// Cooperative, asynchronous stop: flips the record to `stopping` and
    /// fires the scan's token. The background task writes the terminal
    /// status once the pool drains.
    pub fn stop_scan(&self, scan_id: &str) -> Result<(), StopError> {
        let token = self.registry.lock().request_stop(scan_id)?;
        info!("Stop requested for scan {scan_id}");
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }

    pub fn list_scans(&self) -> Vec<ScanRecord> {
        self.registry.lock().list()
    }

    pub fn get_scan(&self, scan_id: &str) -> Option<ScanRecord> {
        self.registry.lock().get(scan_id)
    }

    /// Used by the shutdown path: cancel whatever is in flight.
    pub fn cancel_active(&self) {
        if let Some(token) = self.registry.lock().active_token() {
            token.cancel();
        }
    }

    async fn run_scan(
        self: Arc<Self>,
        scan_id: String,
        work_items: Vec<WorkItem>,
        cancel: CancellationToken,
        max_active: usize,
    ) {
        self.registry.lock().mark_running(&scan_id, epoch_now());

        let options = ScanOptions {
            max_active,
            rate: self.config.masscan_rate(max_active),
            port_start: self.config.scan.port_start,
            port_end: self.config.scan.port_end,
            masscan_path: self.config.scan.masscan_path.clone(),
            live_output: false,
        };
        let hooks = ScanHooks {
            subnet_done: Some({
                let engine = self.clone();
                let scan_id = scan_id.clone();
                Arc::new(move |item: &WorkItem| {
                    engine.registry.lock().record_progress(&scan_id, item.hosts);
                })
            }),
            endpoint_found: None,
        };

        let result = scan::run_pool(
            work_items,
            options,
            self.pinger.clone(),
            cancel.clone(),
            hooks,
        )
        .await;

        let finished_at = epoch_now();
        let mut registry = self.registry.lock();
        match result {
            Ok(()) => {
                registry.finalize_drained(&scan_id, finished_at, cancel.is_cancelled());
                info!("Scan {scan_id} drained");
            }
            Err(err) => {
                error!("Scan {scan_id} failed: {err}");
                registry.finalize_failed(&scan_id, finished_at, err.to_string());
            }
        }
    }
}
