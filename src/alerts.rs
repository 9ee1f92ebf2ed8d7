//! Alert and escalation manager
//!
//! The sweep scans for lapsed deadlines and exhausted outbox entries and
//! keeps the alert table in step with them: it raises one open alert per
//! resource and type, closes alerts whose condition cleared, and escalates
//! critical deadline alerts that stayed open too long. "Open" is always the
//! query `resolved_at IS NULL` over the table; no alert state lives in
//! memory.

use crate::audit::AuditDraft;
use crate::config::SweepConfig;
use crate::error::{ComplianceError, Result};
use crate::shutdown::{self, Shutdown};
use crate::store::{LocalStore, Tables, Transaction};
use crate::types::{AlertSeverity, AlertType, AuditAlert, OutboxStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Actor recorded on audit entries written by the sweep
pub const SWEEP_ACTOR: &str = "system:sweep";

/// `resolved_by` on alerts closed because their condition cleared
pub const AUTO_RESOLVER: &str = "system";

const ALERT_RESOURCE: &str = "audit_alert";

/// Counters from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// New alerts written
    pub raised: usize,
    /// Lapsed conditions that already had an open alert
    pub deduplicated: usize,
    /// Critical alerts raised to emergency
    pub escalated: usize,
    /// Alerts closed because their condition cleared
    pub auto_resolved: usize,
    /// Another sweep was still running; nothing was done
    pub skipped: bool,
}

/// Insert `alert` unless an open alert for the same resource and type exists
pub(crate) fn raise_deduped(tx: &mut Transaction<'_>, alert: AuditAlert) -> Result<Option<AuditAlert>> {
    if let Some(existing) = tx
        .tables()
        .open_alert_for(&alert.resource_id, alert.alert_type)
    {
        tracing::debug!(
            alert_id = %existing.id,
            alert_type = %alert.alert_type,
            resource_id = %alert.resource_id,
            "Alert already open, not raised again"
        );
        return Ok(None);
    }

    tx.put_alert(alert.clone())?;
    tracing::warn!(
        alert_id = %alert.id,
        alert_type = %alert.alert_type,
        severity = ?alert.severity,
        resource_id = %alert.resource_id,
        message = %alert.message,
        "Alert raised"
    );
    Ok(Some(alert))
}

/// A currently lapsed condition the sweep keeps an alert open for
#[derive(Debug, Clone)]
struct Lapse {
    alert_type: AlertType,
    severity: AlertSeverity,
    resource_type: String,
    resource_id: String,
    message: String,
}

impl Lapse {
    fn key(&self) -> (AlertType, String) {
        (self.alert_type, self.resource_id.clone())
    }
}

/// Alert types owned by the sweep; sync conflicts close through resolution
fn sweep_owned(alert_type: AlertType) -> bool {
    !matches!(alert_type, AlertType::SyncConflict)
}

fn lapses(tables: &Tables, now: DateTime<Utc>) -> Vec<Lapse> {
    let mut found = Vec::new();

    for incident in tables.breaches.values() {
        if incident.regulator_notice_overdue(now) {
            found.push(Lapse {
                alert_type: AlertType::ComplianceViolation,
                severity: AlertSeverity::Critical,
                resource_type: "breach_incident".to_string(),
                resource_id: incident.id.clone(),
                message: format!(
                    "Regulator notification for breach '{}' was due {}",
                    incident.id,
                    incident
                        .cai_notification_due
                        .map(|d| d.to_rfc3339())
                        .unwrap_or_default()
                ),
            });
        }
        if incident.user_notice_overdue(now) {
            found.push(Lapse {
                alert_type: AlertType::DataBreach,
                severity: AlertSeverity::Critical,
                resource_type: "breach_incident".to_string(),
                resource_id: incident.id.clone(),
                message: format!(
                    "{} affected users of breach '{}' not notified by {}",
                    incident.affected_user_ids.len(),
                    incident.id,
                    incident
                        .user_notification_due
                        .map(|d| d.to_rfc3339())
                        .unwrap_or_default()
                ),
            });
        }
    }

    for request in tables.requests.values() {
        if request.overdue(now) {
            found.push(Lapse {
                alert_type: AlertType::ComplianceViolation,
                severity: AlertSeverity::Critical,
                resource_type: "data_subject_request".to_string(),
                resource_id: request.id.clone(),
                message: format!(
                    "Data-subject request '{}' ({}) is past its response deadline",
                    request.id, request.status
                ),
            });
        }
    }

    let mut degraded = HashSet::new();
    for entry in tables.outbox.values() {
        if entry.status == OutboxStatus::Failed && degraded.insert(entry.entity_id.clone()) {
            found.push(Lapse {
                alert_type: AlertType::SyncDegraded,
                severity: AlertSeverity::Warning,
                resource_type: entry.entity_type.clone(),
                resource_id: entry.entity_id.clone(),
                message: format!(
                    "Delivery of {} '{}' failed after {} attempts: {}",
                    entry.entity_type,
                    entry.entity_id,
                    entry.attempts,
                    entry.last_error.as_deref().unwrap_or("unknown error")
                ),
            });
        }
    }

    found
}

/// Clears the running flag when a sweep ends, including on error
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Raises, deduplicates, escalates and resolves alerts
pub struct AlertManager {
    store: Arc<LocalStore>,
    config: SweepConfig,
    running: AtomicBool,
}

impl AlertManager {
    pub fn new(store: Arc<LocalStore>, config: SweepConfig) -> Self {
        Self {
            store,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Run one sweep
    ///
    /// Only one sweep runs at a time; a call made while another is in
    /// progress returns immediately with `skipped` set.
    pub async fn sweep(&self) -> Result<SweepReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sweep already running, skipped");
            return Ok(SweepReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = RunningGuard(&self.running);

        let escalate_after = chrono::Duration::hours(self.config.escalate_after_hours);
        let report = self
            .store
            .transaction(SWEEP_ACTOR, |tx| {
                let now = tx.now();
                let mut report = SweepReport::default();
                let current = lapses(tx.tables(), now);
                let lapsed: HashSet<(AlertType, String)> = current.iter().map(Lapse::key).collect();

                let cleared: Vec<AuditAlert> = tx
                    .tables()
                    .alerts
                    .values()
                    .filter(|a| a.is_open() && sweep_owned(a.alert_type))
                    .filter(|a| !lapsed.contains(&(a.alert_type, a.resource_id.clone())))
                    .cloned()
                    .collect();
                for mut alert in cleared {
                    alert.resolved_at = Some(now);
                    alert.resolved_by = Some(AUTO_RESOLVER.to_string());
                    alert.auto_resolved = true;
                    tx.put_alert(alert.clone())?;
                    tx.audit().append(
                        AuditDraft::new(SWEEP_ACTOR, "alert.auto_resolve", ALERT_RESOURCE, &alert.id)
                            .with_details(serde_json::json!({
                                "alertType": alert.alert_type,
                                "resourceId": alert.resource_id,
                            })),
                    )?;
                    tracing::info!(
                        alert_id = %alert.id,
                        alert_type = %alert.alert_type,
                        resource_id = %alert.resource_id,
                        "Alert auto-resolved, condition cleared"
                    );
                    report.auto_resolved += 1;
                }

                for lapse in current {
                    let alert = AuditAlert::new(
                        lapse.alert_type,
                        lapse.severity,
                        lapse.message,
                        lapse.resource_type,
                        lapse.resource_id,
                        now,
                    );
                    match raise_deduped(tx, alert)? {
                        Some(alert) => {
                            tx.audit().append(
                                AuditDraft::new(SWEEP_ACTOR, "alert.raise", ALERT_RESOURCE, &alert.id)
                                    .with_details(serde_json::json!({
                                        "alertType": alert.alert_type,
                                        "severity": alert.severity,
                                        "resourceType": alert.resource_type,
                                        "resourceId": alert.resource_id,
                                    })),
                            )?;
                            report.raised += 1;
                        }
                        None => report.deduplicated += 1,
                    }
                }

                let stale: Vec<AuditAlert> = tx
                    .tables()
                    .alerts
                    .values()
                    .filter(|a| {
                        a.is_open()
                            && a.severity == AlertSeverity::Critical
                            && a.escalated_at.is_none()
                            && a.triggered_at + escalate_after <= now
                    })
                    .cloned()
                    .collect();
                for mut alert in stale {
                    alert.severity = AlertSeverity::Emergency;
                    alert.escalated_at = Some(now);
                    tx.put_alert(alert.clone())?;
                    tx.audit().append(
                        AuditDraft::new(SWEEP_ACTOR, "alert.escalate", ALERT_RESOURCE, &alert.id)
                            .with_details(serde_json::json!({
                                "alertType": alert.alert_type,
                                "resourceId": alert.resource_id,
                                "openSince": alert.triggered_at,
                            })),
                    )?;
                    tracing::warn!(
                        alert_id = %alert.id,
                        alert_type = %alert.alert_type,
                        resource_id = %alert.resource_id,
                        "Alert escalated to emergency"
                    );
                    report.escalated += 1;
                }

                Ok(report)
            })
            .await?;

        tracing::debug!(
            raised = report.raised,
            deduplicated = report.deduplicated,
            escalated = report.escalated,
            auto_resolved = report.auto_resolved,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Close an open alert by hand
    pub async fn resolve_alert(&self, id: &str, resolved_by: &str) -> Result<AuditAlert> {
        self.store
            .transaction(resolved_by, |tx| {
                let mut alert = tx
                    .alert(id)
                    .cloned()
                    .ok_or_else(|| ComplianceError::NotFound(format!("Alert not found: {}", id)))?;
                if !alert.is_open() {
                    return Err(ComplianceError::AlertAlreadyResolved(alert.id));
                }

                alert.resolved_at = Some(tx.now());
                alert.resolved_by = Some(resolved_by.to_string());
                alert.auto_resolved = false;
                tx.put_alert(alert.clone())?;
                tx.audit().append(
                    AuditDraft::new(resolved_by, "alert.resolve", ALERT_RESOURCE, &alert.id)
                        .with_details(serde_json::json!({
                            "alertType": alert.alert_type,
                            "resourceId": alert.resource_id,
                        })),
                )?;
                tracing::info!(alert_id = %alert.id, resolved_by = resolved_by, "Alert resolved");
                Ok(alert)
            })
            .await
    }

    pub async fn get_alert(&self, id: &str) -> Option<AuditAlert> {
        self.store.read(|t| t.alerts.get(id).cloned()).await
    }

    /// Unresolved alerts, oldest first
    pub async fn open_alerts(&self) -> Vec<AuditAlert> {
        let mut alerts: Vec<AuditAlert> = self
            .store
            .read(|t| t.alerts.values().filter(|a| a.is_open()).cloned().collect())
            .await;
        alerts.sort_by_key(|a| a.triggered_at);
        alerts
    }

    /// Run the sweep every `interval_secs` until shutdown
    pub fn spawn(self: Arc<Self>, mut shutdown: Shutdown) -> JoinHandle<()> {
        let period = std::time::Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = period.as_secs(), "Compliance sweep loop started");

            loop {
                tokio::select! {
                    _ = shutdown::cancelled(&mut shutdown) => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.sweep().await {
                    tracing::warn!(error = %e, "Compliance sweep failed");
                }
            }

            tracing::info!("Compliance sweep loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::compliance::{BreachSeverity, DeadlineEngine, RequestStatus, RequestType};
    use crate::config::DeadlinePolicy;
    use crate::store::MemoryJournal;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    struct Harness {
        store: Arc<LocalStore>,
        clock: Arc<ManualClock>,
        deadlines: DeadlineEngine,
        alerts: AlertManager,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(
            LocalStore::open(Arc::new(MemoryJournal::new()), clock.clone())
                .await
                .unwrap(),
        );
        Harness {
            deadlines: DeadlineEngine::new(store.clone(), DeadlinePolicy::default()),
            alerts: AlertManager::new(store.clone(), SweepConfig::default()),
            store,
            clock,
        }
    }

    #[tokio::test]
    async fn test_overdue_regulator_notice_raises_once() {
        let h = harness().await;
        let incident = h
            .deadlines
            .report_breach("officer", "x", BreachSeverity::Critical, "x", vec![])
            .await
            .unwrap();

        h.clock.set(Utc.with_ymd_and_hms(2025, 1, 4, 0, 1, 0).unwrap());
        let first = h.alerts.sweep().await.unwrap();
        assert_eq!(first.raised, 1);

        let open = h.alerts.open_alerts().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].alert_type, AlertType::ComplianceViolation);
        assert_eq!(open[0].severity, AlertSeverity::Critical);
        assert_eq!(open[0].resource_id, incident.id);

        let second = h.alerts.sweep().await.unwrap();
        assert_eq!(second.raised, 0);
        assert_eq!(second.deduplicated, 1);
        assert_eq!(h.alerts.open_alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_raised_before_due() {
        let h = harness().await;
        h.deadlines
            .report_breach("officer", "x", BreachSeverity::Critical, "x", vec!["u-1".to_string()])
            .await
            .unwrap();

        h.clock.set(Utc.with_ymd_and_hms(2025, 1, 1, 23, 0, 0).unwrap());
        let report = h.alerts.sweep().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(h.store.read(|t| t.audit.len()).await, 1);
    }

    #[tokio::test]
    async fn test_cleared_condition_auto_resolves() {
        let h = harness().await;
        let incident = h
            .deadlines
            .report_breach("officer", "x", BreachSeverity::Low, "x", vec!["u-1".to_string()])
            .await
            .unwrap();

        h.clock.advance(chrono::Duration::hours(25));
        h.alerts.sweep().await.unwrap();
        let alert = h.alerts.open_alerts().await.remove(0);
        assert_eq!(alert.alert_type, AlertType::DataBreach);

        h.deadlines.mark_users_notified("officer", &incident.id).await.unwrap();
        let report = h.alerts.sweep().await.unwrap();
        assert_eq!(report.auto_resolved, 1);

        let closed = h.alerts.get_alert(&alert.id).await.unwrap();
        assert!(closed.auto_resolved);
        assert_eq!(closed.resolved_by.as_deref(), Some(AUTO_RESOLVER));
        assert!(h.alerts.open_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_completed_request_raises_nothing() {
        let h = harness().await;
        let request = h
            .deadlines
            .file_data_subject_request("clerk", "u-1", RequestType::Access, serde_json::json!({}))
            .await
            .unwrap();
        h.deadlines
            .advance_request("clerk", &request.id, RequestStatus::Processing)
            .await
            .unwrap();
        h.clock.set(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
        h.deadlines
            .advance_request("clerk", &request.id, RequestStatus::Completed)
            .await
            .unwrap();

        h.clock.set(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap());
        let report = h.alerts.sweep().await.unwrap();
        assert_eq!(report.raised, 0);
        assert!(h.alerts.open_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_critical_alert_escalates_once() {
        let h = harness().await;
        h.deadlines
            .report_breach("officer", "x", BreachSeverity::High, "x", vec![])
            .await
            .unwrap();

        h.clock.set(Utc.with_ymd_and_hms(2025, 1, 4, 1, 0, 0).unwrap());
        h.alerts.sweep().await.unwrap();

        h.clock.advance(chrono::Duration::hours(23));
        assert_eq!(h.alerts.sweep().await.unwrap().escalated, 0);

        h.clock.advance(chrono::Duration::hours(1));
        assert_eq!(h.alerts.sweep().await.unwrap().escalated, 1);
        let alert = h.alerts.open_alerts().await.remove(0);
        assert_eq!(alert.severity, AlertSeverity::Emergency);
        assert!(alert.escalated_at.is_some());

        h.clock.advance(chrono::Duration::hours(48));
        assert_eq!(h.alerts.sweep().await.unwrap().escalated, 0);
    }

    #[tokio::test]
    async fn test_manual_resolve() {
        let h = harness().await;
        h.deadlines
            .report_breach("officer", "x", BreachSeverity::High, "x", vec![])
            .await
            .unwrap();
        h.clock.set(Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap());
        h.alerts.sweep().await.unwrap();
        let alert = h.alerts.open_alerts().await.remove(0);

        let resolved = h.alerts.resolve_alert(&alert.id, "officer").await.unwrap();
        assert_eq!(resolved.resolved_by.as_deref(), Some("officer"));
        assert!(!resolved.auto_resolved);

        let err = h.alerts.resolve_alert(&alert.id, "officer").await.unwrap_err();
        assert!(matches!(err, ComplianceError::AlertAlreadyResolved(_)));
        assert!(matches!(
            h.alerts.resolve_alert("alr-missing", "officer").await,
            Err(ComplianceError::NotFound(_))
        ));

        // Still overdue, so the next sweep opens a fresh alert
        assert_eq!(h.alerts.sweep().await.unwrap().raised, 1);
    }

    #[tokio::test]
    async fn test_concurrent_sweep_is_skipped() {
        let h = harness().await;
        h.alerts.running.store(true, Ordering::Release);
        let report = h.alerts.sweep().await.unwrap();
        assert!(report.skipped);

        h.alerts.running.store(false, Ordering::Release);
        assert!(!h.alerts.sweep().await.unwrap().skipped);
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let h = harness().await;
        let manager = Arc::new(AlertManager::new(
            h.store.clone(),
            SweepConfig {
                interval_secs: 1,
                ..Default::default()
            },
        ));
        let (tx, rx) = shutdown::channel();
        let handle = manager.spawn(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
