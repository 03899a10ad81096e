//! Certificate refresh
//!
//! [`CertRefresher`] re-verifies and renews a locked batch of stored
//! certificates in one transaction. [`RefreshScheduler`] drives the automatic
//! variant periodically, re-running at once while full batches keep coming.
//!
//! A scheduled run has a time budget. It is checked between records, never
//! by cancelling a CA call: once spent, the records already handled commit
//! and the rest wait for the next run.

use crate::acme::AcmeClient;
use crate::error::TlsError;
use crate::sni::CertMatcher;
use crate::storage::{CertificateRecord, CertificateStore, CertificateTransaction, RefreshCandidates, Selection};
use crate::verify::DomainVerifier;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default scheduler period (6 hours)
const DEFAULT_PERIOD_SECS: u64 = 6 * 3600;

/// Default time budget for one scheduled run
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 30;

/// Batch and candidate tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSettings {
    pub batch_size: usize,
    /// Records with this many consecutive failures are no longer candidates
    pub failure_threshold: u32,
    /// Minimum time since a record was last updated
    pub cooldown: Duration,
    /// Deadline for verifying one domain
    pub verify_timeout: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),
            verify_timeout: Duration::from_secs(5),
        }
    }
}

impl RefreshSettings {
    pub fn candidates(&self) -> Result<RefreshCandidates, TlsError> {
        let cooldown = chrono::Duration::from_std(self.cooldown)
            .map_err(|e| TlsError::Config(format!("refresh cooldown out of range: {}", e)))?;
        Ok(RefreshCandidates {
            failure_threshold: self.failure_threshold,
            batch_size: self.batch_size,
            cooldown,
        })
    }
}

/// What one refresh batch did
#[derive(Debug, Default)]
pub struct RefreshOutcome {
    pub refreshed: Vec<CertificateRecord>,
    /// Records that failed verification, with status and failure count updated
    pub failed: Vec<CertificateRecord>,
    /// Cache invalidations that failed after the commit
    pub invalidation_errors: Vec<(String, TlsError)>,
    /// Locked records left untouched because the time budget ran out
    pub deferred: usize,
}

impl RefreshOutcome {
    pub fn len(&self) -> usize {
        self.refreshed.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Re-verifies and renews stored certificates
pub struct CertRefresher {
    store: Arc<dyn CertificateStore>,
    verifier: Arc<dyn DomainVerifier>,
    acme: Arc<AcmeClient>,
    matcher: Arc<CertMatcher>,
    settings: RefreshSettings,
}

impl CertRefresher {
    pub fn new(
        store: Arc<dyn CertificateStore>,
        verifier: Arc<dyn DomainVerifier>,
        acme: Arc<AcmeClient>,
        matcher: Arc<CertMatcher>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            store,
            verifier,
            acme,
            matcher,
            settings,
        }
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    /// Refresh the selected records as one unit.
    ///
    /// Verification failures are recorded on the record and do not stop the
    /// batch; any other error rolls the whole batch back, recorded failures
    /// included.
    pub async fn refresh(&self, selection: &Selection) -> Result<RefreshOutcome, TlsError> {
        self.refresh_until(selection, None).await
    }

    async fn refresh_until(
        &self,
        selection: &Selection,
        deadline: Option<Instant>,
    ) -> Result<RefreshOutcome, TlsError> {
        let mut tx = self.store.begin().await?;

        let records = match tx.lock(selection).await {
            Ok(records) => records,
            Err(e) => {
                rollback(tx).await;
                return Err(e);
            }
        };
        if records.is_empty() {
            debug!("No certificates to refresh");
            tx.rollback().await?;
            return Ok(RefreshOutcome::default());
        }

        let (refreshed, failed, deferred) = match self
            .refresh_locked(tx.as_mut(), records, deadline)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Certificate refresh failed, batch rolled back");
                rollback(tx).await;
                return Err(e);
            }
        };
        tx.commit().await?;

        let mut invalidation_errors = Vec::new();
        for record in &refreshed {
            if let Err(e) = self.matcher.invalidate(&record.domain).await {
                warn!(domain = %record.domain, error = %e, "Failed to invalidate match cache");
                invalidation_errors.push((record.domain.clone(), e));
            }
        }

        let refreshed_domains: Vec<&str> = refreshed.iter().map(|r| r.domain.as_str()).collect();
        let failed_domains: Vec<&str> = failed.iter().map(|r| r.domain.as_str()).collect();
        if failed.is_empty() {
            info!(refreshed = ?refreshed_domains, "Certificates refreshed");
        } else {
            warn!(
                refreshed = ?refreshed_domains,
                failed = ?failed_domains,
                "Certificate refresh finished with failures"
            );
        }

        Ok(RefreshOutcome {
            refreshed,
            failed,
            invalidation_errors,
            deferred,
        })
    }

    async fn refresh_locked(
        &self,
        tx: &mut dyn CertificateTransaction,
        records: Vec<CertificateRecord>,
        deadline: Option<Instant>,
    ) -> Result<(Vec<CertificateRecord>, Vec<CertificateRecord>, usize), TlsError> {
        let mut refreshed = Vec::new();
        let mut failed = Vec::new();
        let mut deferred = 0;

        let total = records.len();
        for (handled, mut record) in records.into_iter().enumerate() {
            // At least one record per run, so a run always makes progress
            if handled > 0 && deadline.is_some_and(|d| Instant::now() >= d) {
                deferred = total - handled;
                warn!(deferred, "Refresh time budget spent, deferring the rest of the batch");
                break;
            }

            if let Err(e) = self
                .verifier
                .verify(&record.domain, self.settings.verify_timeout)
                .await
            {
                warn!(domain = %record.domain, error = %e, "Domain verification failed");
                record.record_verification_failure(&e);
                tx.update(&record).await?;
                failed.push(record);
                continue;
            }

            let resource = record.to_resource()?;
            let renewed = self.acme.renew(&resource).await?;
            record.apply_resource(&renewed)?;
            refreshed.push(record);
        }

        for record in &refreshed {
            tx.update(record).await?;
        }

        Ok((refreshed, failed, deferred))
    }

    /// Refresh one batch of candidates; `true` when the batch was not full
    pub async fn auto_refresh(&self) -> Result<bool, TlsError> {
        self.auto_refresh_by(None).await
    }

    /// Like [`auto_refresh`](Self::auto_refresh), but stops taking new records
    /// once `deadline` has passed. `false` when records were left over.
    pub async fn auto_refresh_until(&self, deadline: Instant) -> Result<bool, TlsError> {
        self.auto_refresh_by(Some(deadline)).await
    }

    async fn auto_refresh_by(&self, deadline: Option<Instant>) -> Result<bool, TlsError> {
        let criteria = self.settings.candidates()?;
        let outcome = self
            .refresh_until(&Selection::RefreshCandidates(criteria), deadline)
            .await?;
        Ok(outcome.deferred == 0 && outcome.len() < criteria.batch_size)
    }
}

async fn rollback(tx: Box<dyn CertificateTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Failed to roll back refresh transaction");
    }
}

/// Periodic driver for [`CertRefresher::auto_refresh`]
pub struct RefreshScheduler {
    refresher: Arc<CertRefresher>,
    period: Duration,
    run_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl RefreshScheduler {
    pub fn new(refresher: Arc<CertRefresher>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            refresher,
            period: Duration::from_secs(DEFAULT_PERIOD_SECS),
            run_timeout: Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
            shutdown_rx,
        }
    }

    /// Set custom period between runs
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Set custom time budget for a single run
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Start the scheduler (runs in background)
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        info!(
            period_secs = self.period.as_secs(),
            batch_size = self.refresher.settings().batch_size,
            "Certificate refresh scheduler started"
        );

        let mut delay = self.period;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    delay = if self.run_once().await {
                        self.period
                    } else {
                        debug!("Refresh batch was full, running again");
                        Duration::ZERO
                    };
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Refresh scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One budgeted run; `true` when the scheduler should wait a full period
    async fn run_once(&self) -> bool {
        let deadline = Instant::now() + self.run_timeout;
        match self.refresher.auto_refresh_until(deadline).await {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "Automatic refresh failed");
                true
            }
        }
    }
}

/// Create a shutdown channel pair
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}
