//! Breach incident and data-subject request types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Breach severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl BreachSeverity {
    /// High and critical breaches must be reported to the regulator
    pub fn requires_regulator_notice(&self) -> bool {
        matches!(self, BreachSeverity::High | BreachSeverity::Critical)
    }
}

/// Breach lifecycle; transitions only move to the immediate successor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachStatus {
    Detected,
    Investigating,
    Contained,
    Resolved,
    Reported,
}

impl BreachStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachStatus::Detected => "detected",
            BreachStatus::Investigating => "investigating",
            BreachStatus::Contained => "contained",
            BreachStatus::Resolved => "resolved",
            BreachStatus::Reported => "reported",
        }
    }

    pub fn successor(&self) -> Option<BreachStatus> {
        match self {
            BreachStatus::Detected => Some(BreachStatus::Investigating),
            BreachStatus::Investigating => Some(BreachStatus::Contained),
            BreachStatus::Contained => Some(BreachStatus::Resolved),
            BreachStatus::Resolved => Some(BreachStatus::Reported),
            BreachStatus::Reported => None,
        }
    }

    pub fn can_advance_to(&self, next: BreachStatus) -> bool {
        self.successor() == Some(next)
    }
}

impl fmt::Display for BreachStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A privacy breach and its notification obligations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreachIncident {
    /// Incident identifier (brc-<uuid>)
    pub id: String,
    /// Free-form classification (e.g., "unauthorized_access", "lost_device")
    #[serde(rename = "type")]
    pub breach_type: String,
    pub severity: BreachSeverity,
    pub description: String,
    #[serde(default)]
    pub affected_user_ids: Vec<String>,
    pub detected_at: DateTime<Utc>,
    /// Regulator notification deadline; set once for high/critical breaches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cai_notification_due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cai_notification_sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cai_notified_at: Option<DateTime<Utc>>,
    /// Individual notification deadline; set once when users are affected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_notification_due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub users_notified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users_notified_at: Option<DateTime<Utc>>,
    pub status: BreachStatus,
    pub updated_at: DateTime<Utc>,
}

impl BreachIncident {
    pub fn new(
        breach_type: impl Into<String>,
        severity: BreachSeverity,
        description: impl Into<String>,
        affected_user_ids: Vec<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("brc-{}", uuid::Uuid::new_v4()),
            breach_type: breach_type.into(),
            severity,
            description: description.into(),
            affected_user_ids,
            detected_at,
            cai_notification_due: None,
            cai_notification_sent: false,
            cai_notified_at: None,
            user_notification_due: None,
            users_notified: false,
            users_notified_at: None,
            status: BreachStatus::Detected,
            updated_at: detected_at,
        }
    }

    /// Regulator deadline passed without notification
    pub fn regulator_notice_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.cai_notification_sent && self.cai_notification_due.is_some_and(|due| due < now)
    }

    /// User deadline passed without notification
    pub fn user_notice_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.users_notified && self.user_notification_due.is_some_and(|due| due < now)
    }
}

/// Kind of data-subject request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Access,
    Rectification,
    Erasure,
    Portability,
    Restriction,
    Objection,
}

/// Data-subject request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    /// Pending and processing requests still owe a response
    pub fn is_open(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::Processing)
    }

    pub fn can_advance_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Rejected)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's request to access, rectify, or erase their data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSubjectRequest {
    /// Request identifier (dsr-<uuid>)
    pub id: String,
    pub user_id: String,
    pub request_type: RequestType,
    #[serde(default)]
    pub details: serde_json::Value,
    pub status: RequestStatus,
    pub requested_at: DateTime<Utc>,
    /// Response deadline; set once on insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DataSubjectRequest {
    pub fn new(
        user_id: impl Into<String>,
        request_type: RequestType,
        details: serde_json::Value,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("dsr-{}", uuid::Uuid::new_v4()),
            user_id: user_id.into(),
            request_type,
            details,
            status: RequestStatus::Pending,
            requested_at,
            due_date: None,
            completed_at: None,
        }
    }

    /// Response deadline passed while the request is still open
    pub fn overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && self.due_date.is_some_and(|due| due < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_breach_status_forward_only() {
        assert!(BreachStatus::Detected.can_advance_to(BreachStatus::Investigating));
        assert!(BreachStatus::Resolved.can_advance_to(BreachStatus::Reported));
        assert!(!BreachStatus::Resolved.can_advance_to(BreachStatus::Detected));
        assert!(!BreachStatus::Detected.can_advance_to(BreachStatus::Contained));
        assert!(!BreachStatus::Contained.can_advance_to(BreachStatus::Contained));
        assert_eq!(BreachStatus::Reported.successor(), None);
    }

    #[test]
    fn test_request_status_transitions() {
        assert!(RequestStatus::Pending.can_advance_to(RequestStatus::Processing));
        assert!(RequestStatus::Processing.can_advance_to(RequestStatus::Completed));
        assert!(RequestStatus::Pending.can_advance_to(RequestStatus::Cancelled));
        assert!(!RequestStatus::Pending.can_advance_to(RequestStatus::Completed));
        assert!(!RequestStatus::Completed.can_advance_to(RequestStatus::Processing));
        assert!(!RequestStatus::Rejected.can_advance_to(RequestStatus::Pending));
    }

    #[test]
    fn test_regulator_notice_requirement() {
        assert!(!BreachSeverity::Low.requires_regulator_notice());
        assert!(!BreachSeverity::Medium.requires_regulator_notice());
        assert!(BreachSeverity::High.requires_regulator_notice());
        assert!(BreachSeverity::Critical.requires_regulator_notice());
    }

    #[test]
    fn test_breach_serializes_type_field() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let incident = BreachIncident::new("lost_device", BreachSeverity::High, "Laptop", vec![], at);
        let json = serde_json::to_value(&incident).unwrap();
        assert_eq!(json["type"], "lost_device");
        assert_eq!(json["status"], "detected");
        assert_eq!(json["caiNotificationSent"], false);
        assert!(json.get("caiNotificationDue").is_none());
    }

    #[test]
    fn test_request_overdue_only_when_open() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut request = DataSubjectRequest::new("u-1", RequestType::Access, serde_json::json!({}), at);
        request.due_date = Some(at + chrono::Duration::days(30));

        let later = at + chrono::Duration::days(31);
        assert!(request.overdue(later));

        request.status = RequestStatus::Completed;
        assert!(!request.overdue(later));
    }
}
