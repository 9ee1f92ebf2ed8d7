//! Daily compliance rollup
//!
//! Derived on every query from the store tables; never persisted.

use crate::store::Tables;
use crate::types::{AlertSeverity, OutboxStatus};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Counters over breaches, requests, alerts, audit and sync state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceSnapshot {
    /// UTC day the snapshot was computed for
    pub date: NaiveDate,
    pub computed_at: DateTime<Utc>,

    pub breaches_total: usize,
    /// Breaches not yet reported
    pub breaches_open: usize,
    pub regulator_notices_overdue: usize,
    pub user_notices_overdue: usize,

    pub requests_total: usize,
    pub requests_open: usize,
    pub requests_overdue: usize,
    pub requests_completed: usize,

    pub alerts_open: usize,
    /// Open alerts at critical severity or above
    pub alerts_critical_open: usize,

    /// Audit entries written on `date`
    pub audit_entries_today: usize,
    pub phi_accesses_today: usize,
    pub non_compliant_today: usize,

    pub outbox_pending: usize,
    pub outbox_failed: usize,
    pub conflicts_open: usize,

    /// No lapsed deadline and no open critical alert
    pub compliant: bool,
}

impl ComplianceSnapshot {
    pub fn compute(tables: &Tables, now: DateTime<Utc>) -> Self {
        let date = now.date_naive();
        let breaches = tables.breaches.values();
        let requests = tables.requests.values();

        let regulator_notices_overdue = breaches
            .clone()
            .filter(|b| b.regulator_notice_overdue(now))
            .count();
        let user_notices_overdue = breaches.clone().filter(|b| b.user_notice_overdue(now)).count();
        let requests_overdue = requests.clone().filter(|r| r.overdue(now)).count();

        let open_alerts = tables.alerts.values().filter(|a| a.is_open());
        let alerts_critical_open = open_alerts
            .clone()
            .filter(|a| a.severity >= AlertSeverity::Critical)
            .count();

        let today = tables
            .audit
            .iter()
            .filter(|e| e.timestamp.date_naive() == date);

        Self {
            date,
            computed_at: now,
            breaches_total: tables.breaches.len(),
            breaches_open: breaches
                .filter(|b| b.status != crate::compliance::BreachStatus::Reported)
                .count(),
            regulator_notices_overdue,
            user_notices_overdue,
            requests_total: tables.requests.len(),
            requests_open: requests.clone().filter(|r| r.status.is_open()).count(),
            requests_overdue,
            requests_completed: requests
                .filter(|r| r.status == crate::compliance::RequestStatus::Completed)
                .count(),
            alerts_open: open_alerts.count(),
            alerts_critical_open,
            audit_entries_today: today.clone().count(),
            phi_accesses_today: today.clone().filter(|e| e.phi_accessed).count(),
            non_compliant_today: today.filter(|e| !e.compliant).count(),
            outbox_pending: tables
                .outbox
                .values()
                .filter(|e| e.status == OutboxStatus::Pending)
                .count(),
            outbox_failed: tables
                .outbox
                .values()
                .filter(|e| e.status == OutboxStatus::Failed)
                .count(),
            conflicts_open: tables.conflicts.values().filter(|c| c.is_open()).count(),
            compliant: regulator_notices_overdue == 0
                && user_notices_overdue == 0
                && requests_overdue == 0
                && alerts_critical_open == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::{BreachIncident, BreachSeverity, DataSubjectRequest, RequestType};
    use crate::types::{AlertType, AuditAlert, AuditLogEntry};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn audit(at: DateTime<Utc>, phi: bool, compliant: bool) -> AuditLogEntry {
        AuditLogEntry {
            id: format!("aud-{}", uuid::Uuid::new_v4()),
            actor_id: "u".to_string(),
            action: "record.read".to_string(),
            resource_type: "patient".to_string(),
            resource_id: "p-1".to_string(),
            phi_accessed: phi,
            compliant,
            timestamp: at,
            details: None,
        }
    }

    #[test]
    fn test_empty_tables_are_compliant() {
        let snapshot = ComplianceSnapshot::compute(&Tables::default(), t0());
        assert!(snapshot.compliant);
        assert_eq!(snapshot.date, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(snapshot.breaches_total, 0);
    }

    #[test]
    fn test_counts_overdue_and_today() {
        let mut tables = Tables::default();

        let mut incident = BreachIncident::new("x", BreachSeverity::Critical, "x", vec![], t0());
        incident.cai_notification_due = Some(t0() + chrono::Duration::hours(72));
        tables.breaches.insert(incident.id.clone(), incident);

        let mut request = DataSubjectRequest::new("u-1", RequestType::Access, serde_json::json!({}), t0());
        request.due_date = Some(t0() + chrono::Duration::days(30));
        tables.requests.insert(request.id.clone(), request);

        let now = Utc.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap();
        tables.audit.push(audit(t0(), true, true));
        tables.audit.push(audit(now, true, true));
        tables.audit.push(audit(now, false, false));

        let alert = AuditAlert::new(
            AlertType::ComplianceViolation,
            AlertSeverity::Critical,
            "late",
            "breach_incident",
            "brc-1",
            now,
        );
        tables.alerts.insert(alert.id.clone(), alert);

        let snapshot = ComplianceSnapshot::compute(&tables, now);
        assert_eq!(snapshot.breaches_open, 1);
        assert_eq!(snapshot.regulator_notices_overdue, 1);
        assert_eq!(snapshot.user_notices_overdue, 0);
        assert_eq!(snapshot.requests_open, 1);
        assert_eq!(snapshot.requests_overdue, 0);
        assert_eq!(snapshot.alerts_critical_open, 1);
        assert_eq!(snapshot.audit_entries_today, 2);
        assert_eq!(snapshot.phi_accesses_today, 1);
        assert_eq!(snapshot.non_compliant_today, 1);
        assert!(!snapshot.compliant);
    }
}
