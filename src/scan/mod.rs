pub mod masscan;

use std::{collections::VecDeque, sync::Arc};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use self::masscan::OpenEndpoint;
use crate::{probe::Pinger, subnets::WorkItem};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Worker pool cap; also the divisor for the aggregate packet rate and
    /// (halved) the probe fan-out bound.
    pub max_active: usize,
    /// `--max-rate` handed to each masscan child.
    pub rate: f64,
    pub port_start: u16,
    pub port_end: u16,
    pub masscan_path: String,
    /// Stream scanner output line by line instead of collecting it at exit.
    pub live_output: bool,
}

pub type SubnetHook = Arc<dyn Fn(&WorkItem) + Send + Sync>;
pub type EndpointHook = Arc<dyn Fn(&OpenEndpoint) + Send + Sync>;

/// Progress callbacks out of the pool. `subnet_done` fires after a subnet's
/// endpoints have all been dispatched to the probe; `endpoint_found` fires
/// per open endpoint as the scanner reports it (live mode only).
#[derive(Clone, Default)]
pub struct ScanHooks {
    pub subnet_done: Option<SubnetHook>,
    pub endpoint_found: Option<EndpointHook>,
}

/// Drive the whole work list through a fixed pool of workers, each running
/// the scanner and then the probe dispatcher for one subnet at a time.
/// Returns once the queue drains or every worker has observed cancellation.
pub async fn run_pool(
    items: Vec<WorkItem>,
    options: ScanOptions,
    pinger: Arc<Pinger>,
    cancel: CancellationToken,
    hooks: ScanHooks,
) -> eyre::Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let worker_count = options.max_active.min(items.len()).max(1);
    info!(
        "Scan pool start: subnets={}, maxActive={}, workers={}, rate={}",
        items.len(),
        options.max_active,
        worker_count,
        options.rate,
    );

    let queue = Arc::new(Mutex::new(VecDeque::from(items)));
    let mut workers = JoinSet::new();
    for _ in 0..worker_count {
        workers.spawn(worker(
            queue.clone(),
            options.clone(),
            pinger.clone(),
            cancel.clone(),
            hooks.clone(),
        ));
    }
    while let Some(joined) = workers.join_next().await {
        // a panicked worker takes the scan down as failed
        joined.map_err(|err| eyre::eyre!("scan worker died: {err}"))?;
    }
    Ok(())
}

async fn worker(
    queue: Arc<Mutex<VecDeque<WorkItem>>>,
    options: ScanOptions,
    pinger: Arc<Pinger>,
    cancel: CancellationToken,
    hooks: ScanHooks,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let Some(item) = queue.lock().pop_front() else {
            return;
        };
        scan_one(&item, &options, &pinger, &cancel, &hooks).await;
        if let Some(hook) = &hooks.subnet_done {
            hook(&item);
        }
    }
}

/// One subnet end to end: scanner child, then bounded probe fan-out over
/// whatever it found. Endpoints collected before a stop are still probed.
async fn scan_one(
    item: &WorkItem,
    options: &ScanOptions,
    pinger: &Arc<Pinger>,
    cancel: &CancellationToken,
    hooks: &ScanHooks,
) {
    info!("Scan worker start: {}", item.cidr);
    let endpoints =
        masscan::scan_subnet(&item.cidr, options, cancel, hooks.endpoint_found.as_ref()).await;
    info!(
        "Scan worker complete: {} (open endpoints {})",
        item.cidr,
        endpoints.len()
    );
    if endpoints.is_empty() {
        return;
    }

    let concurrency = (options.max_active / 2).max(1);
    futures_util::stream::iter(endpoints.into_iter().filter(OpenEndpoint::is_tcp))
        .for_each_concurrent(concurrency, |endpoint| {
            let pinger = pinger.clone();
            async move {
                pinger.check(endpoint.addr()).await;
            }
        })
        .await;
}
