//! Per-actor rate limiting and the account eligibility gate.

use chrono::{DateTime, Utc};
use std::time::Duration;

use place_core::{Actor, ActorId, ForbiddenReason, PlaceConfig, PlaceError};

use crate::storage::{DurableLog, StoreError};

/// Seconds left before an actor whose last placement was at `last` may
/// place again. Never negative.
pub fn remaining_seconds(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> f64 {
    let Some(last) = last else {
        return 0.0;
    };
    let cooldown_micros = i64::try_from(cooldown.as_micros()).unwrap_or(i64::MAX);
    let ready_at = last.timestamp_micros().saturating_add(cooldown_micros);
    let remaining = ready_at.saturating_sub(now.timestamp_micros());
    if remaining <= 0 {
        0.0
    } else {
        remaining as f64 / 1_000_000.0
    }
}

/// Wait for `actor` as of `now`, read from the durable log.
pub fn wait_seconds(
    log: &dyn DurableLog,
    actor: &ActorId,
    now: DateTime<Utc>,
    cooldown: Duration,
    privileged: bool,
) -> Result<f64, StoreError> {
    if privileged {
        return Ok(0.0);
    }
    let last = log.get_last_placement_time(actor)?;
    Ok(remaining_seconds(last, now, cooldown))
}

#[derive(Debug, Clone)]
pub struct CooldownPolicy {
    cooldown: Duration,
    grace: Duration,
    account_age_cutoff: DateTime<Utc>,
}

impl CooldownPolicy {
    pub fn new(cooldown: Duration, grace: Duration, account_age_cutoff: DateTime<Utc>) -> Self {
        Self {
            cooldown,
            grace,
            account_age_cutoff,
        }
    }

    pub fn from_config(config: &PlaceConfig) -> Self {
        Self::new(
            config.cooldown_duration,
            config.cooldown_grace,
            config.account_age_cutoff,
        )
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Banned, suspended and too-new accounts may not place.
    pub fn check_eligibility(&self, actor: &Actor) -> Result<(), PlaceError> {
        if actor.banned {
            return Err(PlaceError::forbidden(ForbiddenReason::Banned));
        }
        if actor.suspended {
            return Err(PlaceError::forbidden(ForbiddenReason::Suspended));
        }
        if actor.created_at >= self.account_age_cutoff {
            return Err(PlaceError::forbidden(ForbiddenReason::AccountTooNew));
        }
        Ok(())
    }

    pub fn wait_seconds(
        &self,
        log: &dyn DurableLog,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<f64, StoreError> {
        wait_seconds(log, &actor.id, now, self.cooldown, actor.privileged)
    }

    /// Waits within the grace window are forgiven.
    pub fn is_limited(&self, wait_seconds: f64) -> bool {
        wait_seconds > self.grace.as_secs_f64()
    }

    /// Cooldown the actor must observe right after a successful placement.
    pub fn after_placement(&self, actor: &Actor) -> f64 {
        if actor.privileged {
            0.0
        } else {
            self.cooldown.as_secs_f64()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLog;
    use chrono::TimeZone;
    use place_core::Placement;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn policy() -> CooldownPolicy {
        CooldownPolicy::new(
            Duration::from_secs(300),
            Duration::from_secs(2),
            Utc.with_ymd_and_hms(2017, 4, 1, 0, 0, 0).unwrap(),
        )
    }

    fn old_actor(id: &str) -> Actor {
        Actor::new(id, Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_remaining_never_placed() {
        assert_eq!(remaining_seconds(None, at(1000), Duration::from_secs(300)), 0.0);
    }

    #[test]
    fn test_remaining_fractional() {
        let last = Utc.timestamp_micros(1_000_000_000).unwrap();
        let now = Utc.timestamp_micros(1_000_000_000 + 60_500_000).unwrap();
        assert_eq!(remaining_seconds(Some(last), now, Duration::from_secs(300)), 239.5);
    }

    #[test]
    fn test_remaining_clamps_at_zero() {
        assert_eq!(
            remaining_seconds(Some(at(0)), at(10_000), Duration::from_secs(300)),
            0.0
        );
    }

    #[test]
    fn test_wait_from_log() {
        let log = MemoryLog::new();
        let actor = old_actor("a");
        log.append(&Placement::new(Some(actor.id.clone()), 0, 0, 1, at(1000)))
            .unwrap();

        let policy = policy();
        assert_eq!(policy.wait_seconds(&log, &actor, at(1000)).unwrap(), 300.0);
        assert_eq!(policy.wait_seconds(&log, &actor, at(1060)).unwrap(), 240.0);
        assert_eq!(policy.wait_seconds(&log, &actor, at(1400)).unwrap(), 0.0);
    }

    #[test]
    fn test_privileged_waits_zero() {
        let log = MemoryLog::new();
        let admin = old_actor("admin").privileged();
        log.append(&Placement::new(Some(admin.id.clone()), 0, 0, 1, at(1000)))
            .unwrap();
        assert_eq!(policy().wait_seconds(&log, &admin, at(1000)).unwrap(), 0.0);
        assert_eq!(policy().after_placement(&admin), 0.0);
    }

    #[test]
    fn test_grace_window() {
        let policy = policy();
        assert!(!policy.is_limited(1.5));
        assert!(!policy.is_limited(2.0));
        assert!(policy.is_limited(2.1));
    }

    #[test]
    fn test_eligibility_gate() {
        let policy = policy();
        assert!(policy.check_eligibility(&old_actor("a")).is_ok());

        let new_account = Actor::new("n", Utc.with_ymd_and_hms(2017, 4, 1, 0, 0, 0).unwrap());
        assert_eq!(
            policy.check_eligibility(&new_account),
            Err(PlaceError::forbidden(ForbiddenReason::AccountTooNew))
        );

        let mut banned = old_actor("b");
        banned.banned = true;
        assert_eq!(
            policy.check_eligibility(&banned),
            Err(PlaceError::forbidden(ForbiddenReason::Banned))
        );

        let mut suspended = old_actor("s");
        suspended.suspended = true;
        assert_eq!(
            policy.check_eligibility(&suspended),
            Err(PlaceError::forbidden(ForbiddenReason::Suspended))
        );
    }
}
