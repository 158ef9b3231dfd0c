//! The upload worker: drains the ingest queue, applies backlog, pacing and
//! staleness policy, and posts the newest record with bounded retries.
//!
//! One worker per upload target. It is the only task doing network I/O and the
//! only one that sleeps; the producer side never waits on it. A failed post is
//! logged and abandoned, it never ends the loop.

#[cfg(test)]
mod tests;

use crate::config::PostPolicy;
use crate::error::{UploadError, UploadResult};
use crate::protocol::{PostBody, Protocol};
use crate::queue::IngestReceiver;
use crate::rain::RainHistory;
use crate::record::Record;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;

const MAX_ERROR_BODY: usize = 256;

/// Counters shared between a worker and whoever reports on it.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub drained: AtomicU64,
    pub dropped_backlog: AtomicU64,
    pub skipped_stale: AtomicU64,
    pub dry_runs: AtomicU64,
    pub posted: AtomicU64,
    pub failed: AtomicU64,
    pub attempts: AtomicU64,
    pub last_post_unix: AtomicI64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub drained: u64,
    pub dropped_backlog: u64,
    pub skipped_stale: u64,
    pub dry_runs: u64,
    pub posted: u64,
    pub failed: u64,
    pub attempts: u64,
    pub last_post_unix: Option<i64>,
    pub last_error: Option<String>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> WorkerStatus {
        let last_post_unix = self.last_post_unix.load(Ordering::Relaxed);
        WorkerStatus {
            drained: self.drained.load(Ordering::Relaxed),
            dropped_backlog: self.dropped_backlog.load(Ordering::Relaxed),
            skipped_stale: self.skipped_stale.load(Ordering::Relaxed),
            dry_runs: self.dry_runs.load(Ordering::Relaxed),
            posted: self.posted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            last_post_unix: (last_post_unix != 0).then_some(last_post_unix),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

/// What one pass of the loop did with its batch.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Posted { attempts: u32 },
    Failed { attempts: u32 },
    DryRun,
    Stale { age_secs: i64 },
    BuildFailed,
    Cancelled,
}

pub struct UploadWorker<P: Protocol> {
    protocol: P,
    policy: PostPolicy,
    client: Client,
    rx: IngestReceiver<Record>,
    stats: Arc<WorkerStats>,
    rain: RainHistory,
    last_post: Option<Instant>,
    span: tracing::Span,
}

impl<P: Protocol> UploadWorker<P> {
    /// `span` carries the target's identity on every line the worker logs.
    pub fn new(
        protocol: P,
        policy: PostPolicy,
        rx: IngestReceiver<Record>,
        stats: Arc<WorkerStats>,
        span: tracing::Span,
    ) -> UploadResult<Self> {
        let client = Client::builder()
            .timeout(policy.timeout)
            .connect_timeout(policy.timeout.min(Duration::from_secs(30)))
            .build()
            .map_err(|err| UploadError::configuration(format!("http client: {err}")))?;

        Ok(Self {
            protocol,
            policy,
            client,
            rx,
            stats,
            rain: RainHistory::new(),
            last_post: None,
            span,
        })
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let span = self.span.clone();
        tokio::spawn(self.run(cancel).instrument(span))
    }

    /// Runs until `cancel` fires or every producer is gone. A cycle already
    /// posting finishes first; waits for pacing or retry are abandoned.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::debug!(policy = ?self.policy, "upload worker started");
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.rx.drain_blocking() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            if self.run_cycle(batch, &cancel).await == CycleOutcome::Cancelled {
                break;
            }
        }
        tracing::info!("upload worker stopped");
    }

    pub async fn run_cycle(&mut self, batch: Vec<Record>, cancel: &CancellationToken) -> CycleOutcome {
        self.stats
            .drained
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        for record in &batch {
            self.rain.observe(record);
        }

        let (batch, dropped) = trim_backlog(batch, self.policy.max_backlog);
        if dropped > 0 {
            self.stats
                .dropped_backlog
                .fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::info!(dropped, kept = batch.len(), "dropped backlog records");
        }

        if !self.wait_for_interval(cancel).await {
            tracing::info!("shutdown while waiting for post interval; record abandoned");
            return CycleOutcome::Cancelled;
        }

        let Some(mut record) = select_newest(batch) else {
            return CycleOutcome::BuildFailed;
        };
        if let Err(UploadError::StaleData { age_secs, threshold_secs }) =
            check_stale(record.date_time(), Utc::now().timestamp(), self.policy.stale)
        {
            self.stats.skipped_stale.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                record = %format_timestamp(record.date_time()),
                age_secs,
                threshold_secs,
                "skipping stale record"
            );
            return CycleOutcome::Stale { age_secs };
        }

        self.rain.fill_totals(&mut record);
        let (url, body) = match self.build(&record) {
            Ok(built) => built,
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::error!(
                    record = %format_timestamp(record.date_time()),
                    error = %err,
                    "failed to build post"
                );
                return CycleOutcome::BuildFailed;
            }
        };

        self.mark_post();
        if self.policy.skip_upload {
            self.stats.dry_runs.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                record = %format_timestamp(record.date_time()),
                url = %self.protocol.redacted_url(&record),
                body = %String::from_utf8_lossy(&body.body),
                "skip_upload set; post suppressed"
            );
            return CycleOutcome::DryRun;
        }

        let (result, attempts) = self.post_with_retry(&url, &body, cancel).await;
        match result {
            Ok(()) => {
                self.stats.posted.fetch_add(1, Ordering::Relaxed);
                self.stats.clear_error();
                if self.policy.log_success {
                    tracing::info!(
                        record = %format_timestamp(record.date_time()),
                        attempts,
                        "published record"
                    );
                }
                CycleOutcome::Posted { attempts }
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                if self.policy.log_failure {
                    tracing::error!(
                        record = %format_timestamp(record.date_time()),
                        attempts,
                        error = %err,
                        "failed to publish record; abandoning it"
                    );
                }
                CycleOutcome::Failed { attempts }
            }
        }
    }

    fn build(&self, record: &Record) -> UploadResult<(Url, PostBody)> {
        let url = self.protocol.format_url(record)?;
        let body = self.protocol.post_body(record)?;
        Ok((url, body))
    }

    fn mark_post(&mut self) {
        self.last_post = Some(Instant::now());
        self.stats
            .last_post_unix
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// False when cancelled before the interval elapsed.
    async fn wait_for_interval(&self, cancel: &CancellationToken) -> bool {
        let (Some(interval), Some(last_post)) = (self.policy.post_interval, self.last_post) else {
            return true;
        };
        let ready_at = last_post + interval;
        let now = Instant::now();
        if ready_at <= now {
            return true;
        }
        tracing::debug!(
            wait_ms = (ready_at - now).as_millis() as u64,
            "waiting for post interval"
        );
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep_until(ready_at) => true,
        }
    }

    /// Returns the final result and the number of attempts made.
    async fn post_with_retry(
        &self,
        url: &Url,
        body: &PostBody,
        cancel: &CancellationToken,
    ) -> (UploadResult<()>, u32) {
        let max_tries = self.policy.max_tries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            let err = match self.post_once(url, body).await {
                Ok(()) => return (Ok(()), attempt),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= max_tries {
                return (Err(err), attempt);
            }
            tracing::debug!(
                attempt,
                max_tries,
                retry_wait_ms = self.policy.retry_wait.as_millis() as u64,
                error = %err,
                "post failed; retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return (Err(err), attempt),
                _ = tokio::time::sleep(self.policy.retry_wait) => {}
            }
        }
    }

    async fn post_once(&self, url: &Url, body: &PostBody) -> UploadResult<()> {
        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, body.content_type)
            .body(body.body.clone())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(UploadError::Rejected {
            status,
            body: truncate(&text, MAX_ERROR_BODY),
        })
    }
}

/// Keeps the newest `max_backlog` records (all when 0) and reports how many of
/// the oldest were dropped.
pub fn trim_backlog<T>(mut batch: Vec<T>, max_backlog: usize) -> (Vec<T>, usize) {
    if max_backlog == 0 || batch.len() <= max_backlog {
        return (batch, 0);
    }
    let dropped = batch.len() - max_backlog;
    batch.drain(..dropped);
    (batch, dropped)
}

/// The last record to arrive stands for the whole batch.
pub fn select_newest<T>(batch: Vec<T>) -> Option<T> {
    batch.into_iter().next_back()
}

/// `Err(StaleData)` when the record is older than `stale`; unset never expires.
pub fn check_stale(date_time: i64, now: i64, stale: Option<Duration>) -> UploadResult<()> {
    let Some(stale) = stale else {
        return Ok(());
    };
    let age_secs = now.saturating_sub(date_time);
    let threshold_secs = stale.as_secs();
    if age_secs > i64::try_from(threshold_secs).unwrap_or(i64::MAX) {
        return Err(UploadError::StaleData {
            age_secs,
            threshold_secs,
        });
    }
    Ok(())
}

fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
