//! Upload targets as host-facing services: one queue and one worker each, fed
//! by the host's "new archive record" event.

use crate::config::{obfuscate, SiteConfig, SiteOptions, StationInfo};
use crate::error::UploadResult;
use crate::protocol::{OpenWeatherMap, Protocol};
use crate::queue::{ingest_queue, IngestSender};
use crate::record::Record;
use crate::worker::{UploadWorker, WorkerStats, WorkerStatus};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct UploadService {
    station_id: String,
    protocol: String,
    tx: IngestSender<Record>,
    stats: Arc<WorkerStats>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub protocol: String,
    pub station_id: String,
    pub running: bool,
    pub queue_depth: u64,
    pub worker: WorkerStatus,
}

impl UploadService {
    pub fn start(site: SiteConfig, cancel: CancellationToken) -> UploadResult<Self> {
        let protocol = OpenWeatherMap::new(&site);
        let protocol_name = protocol.name().to_string();
        let station_id = protocol.station_id().to_string();
        let (latitude, longitude, altitude) = protocol.location();
        let span = tracing::info_span!(
            "upload",
            protocol = %protocol_name,
            station_id = %station_id
        );
        let (tx, rx) = ingest_queue();
        let stats = Arc::new(WorkerStats::new());
        let worker = UploadWorker::new(protocol, site.policy.clone(), rx, stats.clone(), span)?;
        let handle = worker.spawn(cancel);

        tracing::info!(
            protocol = %protocol_name,
            station_id = %station_id,
            appid = %obfuscate(&site.appid),
            latitude,
            longitude,
            altitude,
            skip_upload = site.policy.skip_upload,
            "data will be uploaded"
        );

        Ok(Self {
            station_id,
            protocol: protocol_name,
            tx,
            stats,
            handle,
        })
    }

    /// Resolves and starts one target. A configuration error is logged once
    /// and only this target stays down.
    pub fn from_options(
        options: &SiteOptions,
        station: &StationInfo,
        cancel: CancellationToken,
    ) -> Option<Self> {
        match options
            .resolve(station)
            .and_then(|site| Self::start(site, cancel))
        {
            Ok(service) => Some(service),
            Err(err) => {
                tracing::error!(
                    station_id = options.station_id.as_deref().unwrap_or("<unset>"),
                    error = %err,
                    "data will not be posted"
                );
                None
            }
        }
    }

    /// Host event hook. Never blocks.
    pub fn new_archive_record(&self, record: Record) -> bool {
        self.tx.enqueue(record)
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            protocol: self.protocol.clone(),
            station_id: self.station_id.clone(),
            running: !self.handle.is_finished(),
            queue_depth: self.tx.depth(),
            worker: self.stats.snapshot(),
        }
    }

    /// Waits for the worker to finish its current cycle and exit.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            tracing::error!(station_id = %self.station_id, error = %err, "upload worker panicked");
        }
    }
}

/// Every running target; each record goes to all of them.
#[derive(Default)]
pub struct UploadServices {
    services: Vec<UploadService>,
}

impl UploadServices {
    pub fn start_all(
        sites: &[SiteOptions],
        station: &StationInfo,
        cancel: &CancellationToken,
    ) -> Self {
        let services = sites
            .iter()
            .filter_map(|options| UploadService::from_options(options, station, cancel.child_token()))
            .collect();
        Self { services }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Returns how many targets accepted the record.
    pub fn dispatch(&self, record: &Record) -> usize {
        self.services
            .iter()
            .filter(|service| service.new_archive_record(record.clone()))
            .count()
    }

    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.services.iter().map(UploadService::status).collect()
    }

    pub async fn join_all(self) {
        futures::future::join_all(self.services.into_iter().map(UploadService::join)).await;
    }
}
