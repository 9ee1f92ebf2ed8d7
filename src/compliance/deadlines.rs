//! Insert observers and statutory due-date computation
//!
//! Observers run synchronously inside the transaction that inserts a breach
//! or a data-subject request, before the row is written. Due dates are set
//! once; an already-set date is never recomputed.

use super::types::{BreachIncident, DataSubjectRequest};
use crate::config::DeadlinePolicy;
use crate::error::Result;
use crate::store::Transaction;

/// Hook invoked on compliance inserts
pub trait InsertObserver: Send + Sync {
    fn on_breach_insert(
        &self,
        _tx: &mut Transaction<'_>,
        _incident: &mut BreachIncident,
    ) -> Result<()> {
        Ok(())
    }

    fn on_request_insert(
        &self,
        _tx: &mut Transaction<'_>,
        _request: &mut DataSubjectRequest,
    ) -> Result<()> {
        Ok(())
    }
}

/// Fill in missing breach deadlines; returns whether anything changed
pub fn apply_breach_deadlines(policy: &DeadlinePolicy, incident: &mut BreachIncident) -> bool {
    let mut changed = false;
    if incident.cai_notification_due.is_none() && incident.severity.requires_regulator_notice() {
        incident.cai_notification_due = Some(incident.detected_at + policy.regulator_window());
        changed = true;
    }
    if incident.user_notification_due.is_none() && !incident.affected_user_ids.is_empty() {
        incident.user_notification_due = Some(incident.detected_at + policy.user_window());
        changed = true;
    }
    changed
}

/// Fill in a missing request deadline; returns whether it changed
pub fn apply_request_deadline(policy: &DeadlinePolicy, request: &mut DataSubjectRequest) -> bool {
    if request.due_date.is_some() {
        return false;
    }
    request.due_date = Some(request.requested_at + policy.request_window());
    true
}

/// Computes statutory due dates on insert
pub struct DeadlineObserver {
    policy: DeadlinePolicy,
}

impl DeadlineObserver {
    pub fn new(policy: DeadlinePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DeadlinePolicy {
        &self.policy
    }
}

impl InsertObserver for DeadlineObserver {
    fn on_breach_insert(
        &self,
        _tx: &mut Transaction<'_>,
        incident: &mut BreachIncident,
    ) -> Result<()> {
        if apply_breach_deadlines(&self.policy, incident) {
            tracing::debug!(
                breach_id = %incident.id,
                cai_due = ?incident.cai_notification_due,
                user_due = ?incident.user_notification_due,
                "Breach deadlines computed"
            );
        }
        Ok(())
    }

    fn on_request_insert(
        &self,
        _tx: &mut Transaction<'_>,
        request: &mut DataSubjectRequest,
    ) -> Result<()> {
        if apply_request_deadline(&self.policy, request) {
            tracing::debug!(request_id = %request.id, due = ?request.due_date, "Request deadline computed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::types::{BreachSeverity, RequestType};
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_critical_breach_gets_72h_regulator_deadline() {
        let mut incident = BreachIncident::new("unauthorized_access", BreachSeverity::Critical, "x", vec![], t0());
        assert!(apply_breach_deadlines(&DeadlinePolicy::default(), &mut incident));
        assert_eq!(
            incident.cai_notification_due,
            Some(Utc.with_ymd_and_hms(2025, 1, 4, 0, 0, 0).unwrap())
        );
        assert!(incident.user_notification_due.is_none());
    }

    #[test]
    fn test_low_breach_with_users_gets_24h_user_deadline() {
        let mut incident = BreachIncident::new(
            "lost_device",
            BreachSeverity::Low,
            "x",
            vec!["u-1".to_string()],
            t0(),
        );
        apply_breach_deadlines(&DeadlinePolicy::default(), &mut incident);
        assert!(incident.cai_notification_due.is_none());
        assert_eq!(
            incident.user_notification_due,
            Some(t0() + chrono::Duration::hours(24))
        );
    }

    #[test]
    fn test_deadlines_are_set_once() {
        let mut incident = BreachIncident::new("x", BreachSeverity::High, "x", vec![], t0());
        apply_breach_deadlines(&DeadlinePolicy::default(), &mut incident);
        let due = incident.cai_notification_due;

        let longer = DeadlinePolicy {
            regulator_notification_hours: 100,
            ..Default::default()
        };
        assert!(!apply_breach_deadlines(&longer, &mut incident));
        assert_eq!(incident.cai_notification_due, due);
    }

    #[test]
    fn test_request_due_in_30_days() {
        let mut request = DataSubjectRequest::new("u-1", RequestType::Erasure, serde_json::json!({}), t0());
        assert!(apply_request_deadline(&DeadlinePolicy::default(), &mut request));
        assert_eq!(
            request.due_date,
            Some(Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap())
        );
        assert!(!apply_request_deadline(&DeadlinePolicy::default(), &mut request));
    }
}
