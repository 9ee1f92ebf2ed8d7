//! Compliance deadline engine
//!
//! Owns the breach-incident and data-subject-request lifecycles. Inserts run
//! the registered `InsertObserver`s inside the same transaction, which is
//! where statutory due dates get computed. Every command writes an audit
//! entry alongside its change.

pub mod deadlines;
pub mod types;

pub use deadlines::{DeadlineObserver, InsertObserver};
pub use types::{
    BreachIncident, BreachSeverity, BreachStatus, DataSubjectRequest, RequestStatus, RequestType,
};

use crate::audit::AuditDraft;
use crate::config::DeadlinePolicy;
use crate::error::{ComplianceError, Result};
use crate::store::LocalStore;
use std::sync::Arc;

const BREACH_RESOURCE: &str = "breach_incident";
const REQUEST_RESOURCE: &str = "data_subject_request";

/// Breach and data-subject-request state machines
pub struct DeadlineEngine {
    store: Arc<LocalStore>,
    policy: DeadlinePolicy,
    observers: Vec<Arc<dyn InsertObserver>>,
}

impl DeadlineEngine {
    /// Engine with the statutory `DeadlineObserver` registered
    pub fn new(store: Arc<LocalStore>, policy: DeadlinePolicy) -> Self {
        let observers: Vec<Arc<dyn InsertObserver>> =
            vec![Arc::new(DeadlineObserver::new(policy.clone()))];
        Self {
            store,
            policy,
            observers,
        }
    }

    /// Register an additional insert observer
    pub fn add_observer(&mut self, observer: Arc<dyn InsertObserver>) {
        self.observers.push(observer);
    }

    pub fn policy(&self) -> &DeadlinePolicy {
        &self.policy
    }

    /// Record a new breach and compute its notification deadlines
    pub async fn report_breach(
        &self,
        actor_id: &str,
        breach_type: &str,
        severity: BreachSeverity,
        description: &str,
        affected_user_ids: Vec<String>,
    ) -> Result<BreachIncident> {
        let incident = self
            .store
            .transaction(actor_id, |tx| {
                let mut incident = BreachIncident::new(
                    breach_type,
                    severity,
                    description,
                    affected_user_ids,
                    tx.now(),
                );
                for observer in &self.observers {
                    observer.on_breach_insert(tx, &mut incident)?;
                }
                tx.put_breach(incident.clone())?;
                tx.audit().append(
                    AuditDraft::new(actor_id, "breach.report", BREACH_RESOURCE, &incident.id)
                        .with_details(serde_json::json!({
                            "type": incident.breach_type,
                            "severity": incident.severity,
                            "affectedUsers": incident.affected_user_ids.len(),
                        })),
                )?;
                Ok(incident)
            })
            .await?;

        tracing::info!(
            breach_id = %incident.id,
            severity = ?incident.severity,
            affected_users = incident.affected_user_ids.len(),
            cai_due = ?incident.cai_notification_due,
            user_due = ?incident.user_notification_due,
            "Breach reported"
        );
        Ok(incident)
    }

    /// Move a breach to its immediate successor status
    pub async fn advance_breach(
        &self,
        actor_id: &str,
        id: &str,
        next: BreachStatus,
    ) -> Result<BreachIncident> {
        let incident = self
            .store
            .transaction(actor_id, |tx| {
                let mut incident = tx
                    .breach(id)
                    .cloned()
                    .ok_or_else(|| ComplianceError::NotFound(format!("Breach not found: {}", id)))?;

                if !incident.status.can_advance_to(next) {
                    return Err(ComplianceError::InvalidTransition {
                        kind: "breach_incident",
                        id: incident.id,
                        from: incident.status.to_string(),
                        to: next.to_string(),
                    });
                }

                let from = incident.status;
                incident.status = next;
                incident.updated_at = tx.now();
                deadlines::apply_breach_deadlines(&self.policy, &mut incident);
                tx.put_breach(incident.clone())?;
                tx.audit().append(
                    AuditDraft::new(actor_id, "breach.advance", BREACH_RESOURCE, &incident.id)
                        .with_details(serde_json::json!({ "from": from, "to": next })),
                )?;
                Ok(incident)
            })
            .await?;

        tracing::info!(breach_id = %incident.id, status = %incident.status, "Breach advanced");
        Ok(incident)
    }

    /// Record that the regulator was notified; repeated calls are no-ops
    pub async fn mark_regulator_notified(&self, actor_id: &str, id: &str) -> Result<BreachIncident> {
        self.store
            .transaction(actor_id, |tx| {
                let mut incident = tx
                    .breach(id)
                    .cloned()
                    .ok_or_else(|| ComplianceError::NotFound(format!("Breach not found: {}", id)))?;
                if incident.cai_notification_sent {
                    return Ok(incident);
                }

                let now = tx.now();
                incident.cai_notification_sent = true;
                incident.cai_notified_at = Some(now);
                incident.updated_at = now;
                tx.put_breach(incident.clone())?;
                tx.audit().append(
                    AuditDraft::new(actor_id, "breach.regulator_notified", BREACH_RESOURCE, &incident.id)
                        .with_details(serde_json::json!({
                            "due": incident.cai_notification_due,
                            "late": incident.cai_notification_due.is_some_and(|due| due < now),
                        })),
                )?;
                tracing::info!(breach_id = %incident.id, "Regulator notification recorded");
                Ok(incident)
            })
            .await
    }

    /// Record that affected users were notified; repeated calls are no-ops
    pub async fn mark_users_notified(&self, actor_id: &str, id: &str) -> Result<BreachIncident> {
        self.store
            .transaction(actor_id, |tx| {
                let mut incident = tx
                    .breach(id)
                    .cloned()
                    .ok_or_else(|| ComplianceError::NotFound(format!("Breach not found: {}", id)))?;
                if incident.users_notified {
                    return Ok(incident);
                }

                let now = tx.now();
                incident.users_notified = true;
                incident.users_notified_at = Some(now);
                incident.updated_at = now;
                tx.put_breach(incident.clone())?;
                tx.audit().append(
                    AuditDraft::new(actor_id, "breach.users_notified", BREACH_RESOURCE, &incident.id)
                        .with_details(serde_json::json!({
                            "due": incident.user_notification_due,
                            "users": incident.affected_user_ids.len(),
                        })),
                )?;
                tracing::info!(breach_id = %incident.id, "User notification recorded");
                Ok(incident)
            })
            .await
    }

    /// File a data-subject request and compute its response deadline
    pub async fn file_data_subject_request(
        &self,
        actor_id: &str,
        user_id: &str,
        request_type: RequestType,
        details: serde_json::Value,
    ) -> Result<DataSubjectRequest> {
        let request = self
            .store
            .transaction(actor_id, |tx| {
                let mut request = DataSubjectRequest::new(user_id, request_type, details, tx.now());
                for observer in &self.observers {
                    observer.on_request_insert(tx, &mut request)?;
                }
                tx.put_request(request.clone())?;
                tx.audit().append(
                    AuditDraft::new(actor_id, "request.file", REQUEST_RESOURCE, &request.id)
                        .with_details(serde_json::json!({
                            "userId": request.user_id,
                            "requestType": request.request_type,
                        })),
                )?;
                Ok(request)
            })
            .await?;

        tracing::info!(
            request_id = %request.id,
            request_type = ?request.request_type,
            due = ?request.due_date,
            "Data-subject request filed"
        );
        Ok(request)
    }

    /// Move a request along its lifecycle
    pub async fn advance_request(
        &self,
        actor_id: &str,
        id: &str,
        next: RequestStatus,
    ) -> Result<DataSubjectRequest> {
        let request = self
            .store
            .transaction(actor_id, |tx| {
                let mut request = tx
                    .request(id)
                    .cloned()
                    .ok_or_else(|| ComplianceError::NotFound(format!("Request not found: {}", id)))?;

                if !request.status.can_advance_to(next) {
                    return Err(ComplianceError::InvalidTransition {
                        kind: "data_subject_request",
                        id: request.id,
                        from: request.status.to_string(),
                        to: next.to_string(),
                    });
                }

                let from = request.status;
                request.status = next;
                if !next.is_open() {
                    request.completed_at = Some(tx.now());
                }
                tx.put_request(request.clone())?;
                tx.audit().append(
                    AuditDraft::new(actor_id, "request.advance", REQUEST_RESOURCE, &request.id)
                        .with_details(serde_json::json!({ "from": from, "to": next })),
                )?;
                Ok(request)
            })
            .await?;

        tracing::info!(request_id = %request.id, status = %request.status, "Request advanced");
        Ok(request)
    }

    pub async fn get_breach(&self, id: &str) -> Option<BreachIncident> {
        self.store.read(|t| t.breaches.get(id).cloned()).await
    }

    /// All breaches, oldest first
    pub async fn list_breaches(&self) -> Vec<BreachIncident> {
        let mut breaches: Vec<_> = self.store.read(|t| t.breaches.values().cloned().collect()).await;
        breaches.sort_by_key(|b: &BreachIncident| b.detected_at);
        breaches
    }

    pub async fn get_request(&self, id: &str) -> Option<DataSubjectRequest> {
        self.store.read(|t| t.requests.get(id).cloned()).await
    }

    /// All requests, oldest first
    pub async fn list_requests(&self) -> Vec<DataSubjectRequest> {
        let mut requests: Vec<_> = self.store.read(|t| t.requests.values().cloned().collect()).await;
        requests.sort_by_key(|r: &DataSubjectRequest| r.requested_at);
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryJournal;
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    async fn engine() -> (DeadlineEngine, Arc<LocalStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(
            LocalStore::open(Arc::new(MemoryJournal::new()), clock.clone())
                .await
                .unwrap(),
        );
        (DeadlineEngine::new(store.clone(), DeadlinePolicy::default()), store, clock)
    }

    #[tokio::test]
    async fn test_report_breach_sets_deadlines_and_audits() {
        let (engine, store, _) = engine().await;
        let incident = engine
            .report_breach(
                "officer",
                "unauthorized_access",
                BreachSeverity::Critical,
                "Shared credentials",
                vec!["u-1".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(
            incident.cai_notification_due,
            Some(Utc.with_ymd_and_hms(2025, 1, 4, 0, 0, 0).unwrap())
        );
        assert_eq!(incident.user_notification_due, Some(t0() + chrono::Duration::hours(24)));
        assert_eq!(engine.get_breach(&incident.id).await.unwrap(), incident);

        let actions: Vec<String> = store.read(|t| t.audit.iter().map(|e| e.action.clone()).collect()).await;
        assert_eq!(actions, vec!["breach.report"]);
    }

    #[tokio::test]
    async fn test_advance_breach_forward_only() {
        let (engine, _, clock) = engine().await;
        let incident = engine
            .report_breach("officer", "x", BreachSeverity::High, "x", vec![])
            .await
            .unwrap();
        let due = incident.cai_notification_due;

        clock.advance(chrono::Duration::hours(5));
        let advanced = engine
            .advance_breach("officer", &incident.id, BreachStatus::Investigating)
            .await
            .unwrap();
        assert_eq!(advanced.status, BreachStatus::Investigating);
        assert_eq!(advanced.cai_notification_due, due);

        let err = engine
            .advance_breach("officer", &incident.id, BreachStatus::Detected)
            .await
            .unwrap_err();
        assert!(matches!(err, ComplianceError::InvalidTransition { .. }));

        let err = engine
            .advance_breach("officer", &incident.id, BreachStatus::Resolved)
            .await
            .unwrap_err();
        assert!(matches!(err, ComplianceError::InvalidTransition { .. }));

        assert_eq!(
            engine.get_breach(&incident.id).await.unwrap().status,
            BreachStatus::Investigating
        );
    }

    #[tokio::test]
    async fn test_mark_notified_is_idempotent() {
        let (engine, store, clock) = engine().await;
        let incident = engine
            .report_breach("officer", "x", BreachSeverity::High, "x", vec!["u-1".to_string()])
            .await
            .unwrap();

        clock.advance(chrono::Duration::hours(1));
        let first = engine.mark_regulator_notified("officer", &incident.id).await.unwrap();
        clock.advance(chrono::Duration::hours(1));
        let second = engine.mark_regulator_notified("officer", &incident.id).await.unwrap();
        assert!(second.cai_notification_sent);
        assert_eq!(first.cai_notified_at, second.cai_notified_at);

        let users = engine.mark_users_notified("officer", &incident.id).await.unwrap();
        assert!(users.users_notified);
        assert_eq!(store.read(|t| t.audit.len()).await, 3);
    }

    #[tokio::test]
    async fn test_request_lifecycle() {
        let (engine, _, clock) = engine().await;
        let request = engine
            .file_data_subject_request("clerk", "u-1", RequestType::Access, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(
            request.due_date,
            Some(Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap())
        );

        let err = engine
            .advance_request("clerk", &request.id, RequestStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, ComplianceError::InvalidTransition { .. }));

        engine
            .advance_request("clerk", &request.id, RequestStatus::Processing)
            .await
            .unwrap();
        clock.set(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
        let done = engine
            .advance_request("clerk", &request.id, RequestStatus::Completed)
            .await
            .unwrap();
        assert_eq!(done.completed_at, Some(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap()));
        assert_eq!(done.due_date, request.due_date);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let (engine, _, _) = engine().await;
        let err = tokio_test::assert_err!(
            engine
                .advance_breach("x", "brc-missing", BreachStatus::Investigating)
                .await
        );
        assert!(matches!(err, ComplianceError::NotFound(_)));
        let err = tokio_test::assert_err!(engine.mark_users_notified("x", "brc-missing").await);
        assert!(matches!(err, ComplianceError::NotFound(_)));
        let err = tokio_test::assert_err!(
            engine
                .advance_request("x", "dsr-missing", RequestStatus::Processing)
                .await
        );
        assert!(matches!(err, ComplianceError::NotFound(_)));
    }

    struct Tagger;

    impl InsertObserver for Tagger {
        fn on_request_insert(
            &self,
            _tx: &mut crate::store::Transaction<'_>,
            request: &mut DataSubjectRequest,
        ) -> Result<()> {
            request.details = serde_json::json!({"tagged": true});
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_custom_observer_runs_in_insert_transaction() {
        let (mut engine, _, _) = engine().await;
        engine.add_observer(Arc::new(Tagger));
        let request = engine
            .file_data_subject_request("clerk", "u-1", RequestType::Erasure, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(request.details["tagged"], true);
        assert!(request.due_date.is_some());
    }
}
