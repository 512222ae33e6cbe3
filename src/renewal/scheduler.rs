//! Background certificate renewal scheduler
//!
//! A fixed-period timer walks every automation-enabled site, one at a time. Per
//! site: skip while the renewal deadline is in the future, otherwise ask the
//! issuer, write the material and push the deadline `renew_after` ahead. Failures
//! retry after `retry_delay`; after `max_attempts` consecutive failures the
//! counter resets and the site cools down for `cooldown`.
//!
//! Every new deadline is persisted through the site registry before it becomes
//! the live value, so a restart resumes the same schedule. If persisting fails,
//! the in-memory retry deadline still holds the site back, but only until the
//! next reload: a reloaded document is the sole source of due dates again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::RenewalConfig;
use crate::sites::{Site, SiteRegistry, Snapshot};
use crate::tls::CertificateSelector;

use super::issuer::{IssuanceError, Issuer};
use super::writer::write_certificate;

/// Timing and retry budget
#[derive(Debug, Clone)]
pub struct RenewalPolicy {
    pub check_interval: Duration,
    pub retry_delay: chrono::Duration,
    pub max_attempts: u32,
    pub cooldown: chrono::Duration,
    pub renew_after: chrono::Duration,
    pub issue_timeout: Duration,
}

impl From<&RenewalConfig> for RenewalPolicy {
    fn from(config: &RenewalConfig) -> Self {
        Self {
            check_interval: Duration::from_secs(config.check_interval_seconds),
            retry_delay: seconds(config.retry_delay_seconds),
            max_attempts: config.max_attempts.max(1),
            cooldown: seconds(config.cooldown_seconds),
            renew_after: chrono::Duration::days(config.renew_after_days),
            issue_timeout: Duration::from_secs(config.issue_timeout_seconds),
        }
    }
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self::from(&RenewalConfig::default())
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

/// Where a site stands in its renewal cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenewalState {
    #[default]
    Idle,
    Checking,
    Issuing,
    Succeeded,
    Failed,
}

/// Transient per-site attempt bookkeeping
#[derive(Debug, Clone, Default)]
pub struct RenewalStatus {
    pub state: RenewalState,
    /// Consecutive failures since the last success or cooldown
    pub attempts: u32,
    /// Earliest time this process will try again; cleared on reload
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Status entries plus the snapshot generation they were derived from
#[derive(Debug, Default)]
struct StatusTable {
    generation: u64,
    /// Keyed by lowercase site name
    sites: HashMap<String, RenewalStatus>,
}

impl StatusTable {
    /// Drop entries of removed sites and every in-memory hold once the
    /// registry has been reloaded.
    fn sync_with(&mut self, snapshot: &Snapshot) {
        if self.generation == snapshot.generation() {
            return;
        }
        self.generation = snapshot.generation();
        self.sites
            .retain(|name, _| snapshot.find_by_name(name).is_some());
        for status in self.sites.values_mut() {
            status.next_retry_at = None;
        }
    }
}

/// Counts for one pass over the sites
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub checked: usize,
    pub issued: usize,
    pub failed: usize,
}

enum Outcome {
    Skipped,
    Issued,
    Failed,
}

/// Periodic renewal driver shared between the timer task and callers.
pub struct RenewalScheduler {
    registry: SiteRegistry,
    issuer: Option<Arc<dyn Issuer>>,
    selector: Option<Arc<CertificateSelector>>,
    policy: RenewalPolicy,
    status: Mutex<StatusTable>,
    missing_issuer_reported: AtomicBool,
}

impl RenewalScheduler {
    /// `selector` is `None` when no HTTPS listener runs; nothing to invalidate then.
    pub fn new(
        registry: SiteRegistry,
        issuer: Option<Arc<dyn Issuer>>,
        selector: Option<Arc<CertificateSelector>>,
        policy: RenewalPolicy,
    ) -> Self {
        Self {
            registry,
            issuer,
            selector,
            policy,
            status: Mutex::new(StatusTable::default()),
            missing_issuer_reported: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &RenewalPolicy {
        &self.policy
    }

    /// Attempt bookkeeping for one site, if it was ever checked
    pub fn status(&self, site: &str) -> Option<RenewalStatus> {
        self.lock_status().sites.get(&site.to_lowercase()).cloned()
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, StatusTable> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update_status(&self, site: &Site, apply: impl FnOnce(&mut RenewalStatus)) {
        let mut status = self.lock_status();
        apply(status.sites.entry(site.name.to_lowercase()).or_default());
    }

    /// Spawn the timer task. The first pass runs immediately.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = self;

        let task = tokio::spawn(async move {
            info!(
                check_interval_secs = scheduler.policy.check_interval.as_secs(),
                issuer = scheduler.issuer.is_some(),
                "Starting certificate renewal scheduler"
            );

            let mut ticker = interval(scheduler.policy.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                // A cycle may sit in a slow issuer call; shutdown must not wait for it
                tokio::select! {
                    summary = scheduler.run_cycle(Utc::now()) => debug!(
                        checked = summary.checked,
                        issued = summary.issued,
                        failed = summary.failed,
                        "Renewal cycle finished"
                    ),
                    _ = shutdown_rx.changed() => {
                        info!("Renewal cycle interrupted by shutdown");
                        break;
                    }
                }
            }

            info!("Certificate renewal scheduler stopped");
        });

        SchedulerHandle { shutdown_tx, task }
    }

    /// One pass over every automation-enabled site in the current snapshot.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleSummary {
        let snapshot = self.registry.snapshot();
        self.lock_status().sync_with(&snapshot);
        let mut summary = CycleSummary::default();

        for site in snapshot.sites().iter().filter(|site| site.certificate_automation) {
            match self.check_site(site, now).await {
                Outcome::Skipped => {}
                Outcome::Issued => {
                    summary.checked += 1;
                    summary.issued += 1;
                }
                Outcome::Failed => {
                    summary.checked += 1;
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    async fn check_site(&self, site: &Site, now: DateTime<Utc>) -> Outcome {
        let Some(issuer) = self.issuer.as_ref() else {
            if !self.missing_issuer_reported.swap(true, Ordering::Relaxed) {
                warn!(
                    site = %site.name,
                    "Certificate automation enabled but no issuer configured; skipping automated sites"
                );
            }
            return Outcome::Skipped;
        };

        self.update_status(site, |status| status.state = RenewalState::Checking);

        let held_back = self
            .status(&site.name)
            .and_then(|status| status.next_retry_at)
            .is_some_and(|at| at > now);
        if !site.renewal_due(now) || held_back {
            self.update_status(site, |status| status.state = RenewalState::Idle);
            return Outcome::Skipped;
        }

        let Some(primary) = site.primary_domain() else {
            return Outcome::Skipped;
        };

        info!(site = %site.name, domain = %primary, "Requesting certificate");
        self.update_status(site, |status| status.state = RenewalState::Issuing);

        let issued = match tokio::time::timeout(
            self.policy.issue_timeout,
            issuer.issue(primary, site.domains()),
        )
        .await
        {
            Ok(Ok(issued)) => issued,
            Ok(Err(e)) => return self.handle_failure(site, now, e.to_string()).await,
            Err(_) => {
                let e = IssuanceError::Timeout(self.policy.issue_timeout);
                return self.handle_failure(site, now, e.to_string()).await;
            }
        };

        let Some(dir) = site.certificate_dir.as_deref() else {
            return self
                .handle_failure(site, now, "site has no certificate directory".to_string())
                .await;
        };
        if let Err(e) = write_certificate(dir, &issued).await {
            return self.handle_failure(site, now, e.to_string()).await;
        }
        if let Some(selector) = &self.selector {
            selector.invalidate();
        }

        let next = now + self.policy.renew_after;
        self.update_status(site, |status| {
            status.state = RenewalState::Succeeded;
            status.attempts = 0;
            status.next_retry_at = Some(next);
            status.last_error = None;
        });
        self.persist(site, next).await;

        info!(site = %site.name, next_renewal = %next, "Certificate renewed");
        Outcome::Issued
    }

    async fn handle_failure(&self, site: &Site, now: DateTime<Utc>, reason: String) -> Outcome {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 0;
        let mut next = now + self.policy.retry_delay;

        self.update_status(site, |status| {
            attempt = status.attempts + 1;
            if attempt >= max_attempts {
                status.attempts = 0;
                next = now + self.policy.cooldown;
            } else {
                status.attempts = attempt;
            }
            status.state = RenewalState::Failed;
            status.next_retry_at = Some(next);
            status.last_error = Some(reason.clone());
        });

        if attempt >= max_attempts {
            error!(
                site = %site.name,
                attempt,
                error = %reason,
                next_renewal = %next,
                "Certificate issuance failed; retry budget exhausted, cooling down"
            );
        } else {
            warn!(
                site = %site.name,
                attempt,
                error = %reason,
                next_renewal = %next,
                "Certificate issuance failed; will retry"
            );
        }

        self.persist(site, next).await;
        Outcome::Failed
    }

    async fn persist(&self, site: &Site, next: DateTime<Utc>) {
        match self.registry.record_next_renewal(&site.name, Some(next)).await {
            Ok(true) => {}
            Ok(false) => warn!(site = %site.name, "Site vanished from site document; deadline not persisted"),
            Err(e) => error!(site = %site.name, error = %e, "Failed to persist renewal deadline"),
        }
    }
}

/// Stops the timer task on shutdown
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the timer to stop and wait for the task to exit.
    ///
    /// An in-flight cycle is abandoned at its next await point; a certificate
    /// write already handed to the blocking pool still completes.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Renewal scheduler task failed");
        }
    }
}
