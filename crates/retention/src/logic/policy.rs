use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};

use crate::repository::RetentionRepositoryLike;

/// How long records of a given table (and optional record type) are kept,
/// and how far ahead of expiry subjects are warned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub table_name: String,
    /// Discriminates policies within one table; empty means the table-wide
    /// default.
    pub record_type: String,
    pub retention_period_days: i64,
    pub grace_period_days: i64,
    pub legal_minimum_days: Option<i64>,
    pub notification_days_before: i64,
    pub is_active: bool,
    pub created_at: WrappedChronoDateTime,
    pub updated_at: WrappedChronoDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetentionDecision {
    pub should_cleanup: bool,
    pub should_notify: bool,
}

/// A retention period below the legal minimum must never be persisted.
pub fn validate_retention_period(
    retention_period_days: i64,
    legal_minimum_days: Option<i64>,
) -> Result<(), CommonError> {
    if retention_period_days <= 0 {
        return Err(CommonError::Validation {
            msg: format!("retention period must be positive, got {retention_period_days}"),
            source: None,
        });
    }

    if let Some(minimum) = legal_minimum_days
        && retention_period_days < minimum
    {
        return Err(CommonError::Validation {
            msg: format!(
                "retention period of {retention_period_days} days is below the legal minimum of {minimum} days"
            ),
            source: None,
        });
    }

    Ok(())
}

/// Pure evaluation of a record's age against a policy. An inactive policy
/// never triggers cleanup or notification.
pub fn evaluate(
    policy: &RetentionPolicy,
    record_timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
) -> RetentionDecision {
    if !policy.is_active {
        return RetentionDecision {
            should_cleanup: false,
            should_notify: false,
        };
    }

    let expires_at = record_timestamp + Duration::days(policy.retention_period_days);
    let notify_from = expires_at - Duration::days(policy.notification_days_before);

    RetentionDecision {
        should_cleanup: now >= expires_at,
        should_notify: now >= notify_from && now < expires_at,
    }
}

/// Validate and persist a policy. Validation runs before the repository is
/// touched so an invalid period can never land in storage.
pub async fn upsert_policy<R>(repo: &R, policy: &RetentionPolicy) -> Result<(), CommonError>
where
    R: RetentionRepositoryLike,
{
    validate_retention_period(policy.retention_period_days, policy.legal_minimum_days)?;
    repo.upsert_policy(policy).await
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use chrono::{Duration, Utc};
    use shared::error::CommonError;
    use shared::primitives::WrappedChronoDateTime;

    use super::{RetentionPolicy, evaluate, validate_retention_period};

    fn policy(retention_days: i64, notify_days: i64, is_active: bool) -> RetentionPolicy {
        RetentionPolicy {
            table_name: "subject".to_string(),
            record_type: String::new(),
            retention_period_days: retention_days,
            grace_period_days: 7,
            legal_minimum_days: Some(7),
            notification_days_before: notify_days,
            is_active,
            created_at: WrappedChronoDateTime::now(),
            updated_at: WrappedChronoDateTime::now(),
        }
    }

    #[test]
    fn test_retention_below_legal_minimum_rejected() {
        let result = validate_retention_period(5, Some(7));
        assert!(matches!(result, Err(CommonError::Validation { .. })));
    }

    #[test]
    fn test_retention_at_or_above_legal_minimum_accepted() {
        assert!(validate_retention_period(7, Some(7)).is_ok());
        assert!(validate_retention_period(10, Some(7)).is_ok());
        assert!(validate_retention_period(1, None).is_ok());
    }

    #[test]
    fn test_non_positive_retention_rejected() {
        assert!(validate_retention_period(0, None).is_err());
        assert!(validate_retention_period(-3, Some(7)).is_err());
    }

    #[test]
    fn test_expired_record_triggers_cleanup() {
        let now = Utc::now();
        let decision = evaluate(&policy(90, 30, true), now - Duration::days(91), now);
        assert!(decision.should_cleanup);
        assert!(!decision.should_notify);
    }

    #[test]
    fn test_cleanup_triggers_exactly_at_expiry() {
        let now = Utc::now();
        let decision = evaluate(&policy(90, 30, true), now - Duration::days(90), now);
        assert!(decision.should_cleanup);
    }

    #[test]
    fn test_record_inside_notification_window() {
        let now = Utc::now();
        // 65 days old with a 90-day retention and 30-day lead: inside window
        let decision = evaluate(&policy(90, 30, true), now - Duration::days(65), now);
        assert!(!decision.should_cleanup);
        assert!(decision.should_notify);
    }

    #[test]
    fn test_record_before_notification_window() {
        let now = Utc::now();
        let decision = evaluate(&policy(90, 30, true), now - Duration::days(30), now);
        assert!(!decision.should_cleanup);
        assert!(!decision.should_notify);
    }

    #[test]
    fn test_inactive_policy_never_triggers() {
        let now = Utc::now();
        let decision = evaluate(&policy(90, 30, false), now - Duration::days(120), now);
        assert!(!decision.should_cleanup);
        assert!(!decision.should_notify);
    }
}
