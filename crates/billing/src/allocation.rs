//! Monthly key allocation
//!
//! A daily batch pass over pro subscriptions whose next allocation date falls
//! today. This is the durability backstop for key grants: webhook delivery is
//! not guaranteed for every billing cycle, so due dates are tracked locally
//! and replayed from here.

use time::{Date, Duration, Month, OffsetDateTime, Time};
use tracing::{error, info};
use workbridge_shared::PlanTier;

use crate::error::BillingResult;
use crate::store::SubscriptionStore;

/// Outcome of one scheduler run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationSummary {
    pub due: usize,
    pub granted: usize,
    pub failed: usize,
}

/// One calendar month later, day-of-month clamped to the target month's length
///
/// Jan 31 maps to Feb 28 (29 in leap years); the time of day is preserved.
pub fn one_month_after(t: OffsetDateTime) -> OffsetDateTime {
    let date = t.date();
    let next_month = date.month().next();
    let year = if next_month == Month::January {
        date.year() + 1
    } else {
        date.year()
    };
    let day = date.day().min(time::util::days_in_month(next_month, year));
    match Date::from_calendar_date(year, next_month, day) {
        Ok(next_date) => t.replace_date(next_date),
        // Unreachable after clamping; fall back to a fixed-length month.
        Err(_) => t + Duration::days(30),
    }
}

/// The [midnight today, midnight tomorrow) window containing `now`, in UTC
pub fn due_window(now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let today = now.replace_time(Time::MIDNIGHT);
    (today, today + Duration::days(1))
}

pub struct KeyAllocationService {
    store: SubscriptionStore,
}

impl KeyAllocationService {
    pub fn new(store: SubscriptionStore) -> Self {
        Self { store }
    }

    /// Grant monthly keys to every pro subscription due today
    ///
    /// Items are processed independently; a failed grant is logged and left
    /// due for the next run since its next-allocation date was not advanced.
    pub async fn run_once(&self) -> BillingResult<AllocationSummary> {
        let now = OffsetDateTime::now_utc();
        let (window_start, window_end) = due_window(now);

        let due = self
            .store
            .due_for_allocation(PlanTier::Pro, window_start, window_end, now)
            .await?;

        let mut summary = AllocationSummary {
            due: due.len(),
            ..Default::default()
        };

        if due.is_empty() {
            info!("no key allocations due today");
            return Ok(summary);
        }

        let amount = PlanTier::Pro.monthly_keys();
        for sub in due {
            let result = async {
                let balance = self.store.grant_keys(sub.user_id, amount).await?;
                self.store
                    .record_allocation(sub.id, now, one_month_after(now))
                    .await?;
                Ok::<i64, crate::error::BillingError>(balance)
            }
            .await;

            match result {
                Ok(balance) => {
                    summary.granted += 1;
                    info!(
                        user_id = %sub.user_id,
                        amount,
                        balance,
                        "monthly keys granted"
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        user_id = %sub.user_id,
                        subscription_id = %sub.id,
                        error = %e,
                        "key allocation failed, will retry next run"
                    );
                }
            }
        }

        info!(
            due = summary.due,
            granted = summary.granted,
            failed = summary.failed,
            "key allocation run complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn one_month_after_plain_date() {
        let t = datetime!(2024-03-15 09:30:00 UTC);
        assert_eq!(one_month_after(t), datetime!(2024-04-15 09:30:00 UTC));
    }

    #[test]
    fn one_month_after_clamps_to_short_month() {
        let t = datetime!(2024-01-31 12:00:00 UTC);
        assert_eq!(one_month_after(t), datetime!(2024-02-29 12:00:00 UTC));

        let t = datetime!(2023-01-31 12:00:00 UTC);
        assert_eq!(one_month_after(t), datetime!(2023-02-28 12:00:00 UTC));

        let t = datetime!(2024-05-31 00:00:00 UTC);
        assert_eq!(one_month_after(t), datetime!(2024-06-30 00:00:00 UTC));
    }

    #[test]
    fn one_month_after_rolls_over_year() {
        let t = datetime!(2024-12-10 23:59:59 UTC);
        assert_eq!(one_month_after(t), datetime!(2025-01-10 23:59:59 UTC));
    }

    #[test]
    fn one_month_after_is_strictly_later() {
        let t = datetime!(2024-02-29 00:00:00 UTC);
        assert!(one_month_after(t) > t);
    }

    #[test]
    fn due_window_spans_exactly_today() {
        let now = datetime!(2024-06-05 14:22:31 UTC);
        let (start, end) = due_window(now);
        assert_eq!(start, datetime!(2024-06-05 00:00:00 UTC));
        assert_eq!(end, datetime!(2024-06-06 00:00:00 UTC));
        assert!(start <= now && now < end);
    }

    #[test]
    fn due_window_includes_midnight_start_excludes_next() {
        let now = datetime!(2024-06-05 00:00:00 UTC);
        let (start, end) = due_window(now);
        assert_eq!(start, now);
        assert_eq!(end - start, Duration::days(1));
    }

    use sqlx::PgPool;
    use uuid::Uuid;
    use workbridge_shared::SubscriptionStatus;

    async fn test_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = workbridge_shared::create_pool(&url)
            .await
            .expect("Failed to create pool");
        workbridge_shared::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        pool
    }

    async fn seed_user(pool: &PgPool) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO users (id, email, key_balance) VALUES ($1, $2, 0)")
            .bind(id)
            .bind(format!("{id}@example.com"))
            .execute(pool)
            .await
            .expect("Failed to seed user");
        id
    }

    async fn seed_pro_subscription(pool: &PgPool, user_id: Uuid, due: OffsetDateTime) {
        sqlx::query(
            "INSERT INTO subscriptions
                (id, user_id, stripe_subscription_id, stripe_customer_id, stripe_price_id,
                 plan_type, status, current_period_start, current_period_end,
                 next_key_allocation)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(format!("sub_test_{user_id}"))
        .bind("cus_test")
        .bind("price_pro_789")
        .bind(PlanTier::Pro)
        .bind(SubscriptionStatus::Active)
        .bind(due - Duration::days(10))
        .bind(due + Duration::days(20))
        .bind(due)
        .execute(pool)
        .await
        .expect("Failed to seed subscription");
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn due_subscription_is_granted_exactly_once() {
        let pool = test_pool().await;
        let store = SubscriptionStore::new(pool.clone());
        let service = KeyAllocationService::new(store.clone());

        let user_id = seed_user(&pool).await;
        seed_pro_subscription(&pool, user_id, OffsetDateTime::now_utc()).await;

        let summary = service.run_once().await.expect("first run");
        assert!(summary.granted >= 1);

        let user = store.get_user(user_id).await.expect("user");
        assert_eq!(user.key_balance, PlanTier::Pro.monthly_keys());

        // The due date advanced a month, so a second pass grants nothing more.
        service.run_once().await.expect("second run");
        let user = store.get_user(user_id).await.expect("user");
        assert_eq!(user.key_balance, PlanTier::Pro.monthly_keys());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn subscription_due_later_is_left_alone() {
        let pool = test_pool().await;
        let store = SubscriptionStore::new(pool.clone());
        let service = KeyAllocationService::new(store.clone());

        let user_id = seed_user(&pool).await;
        seed_pro_subscription(&pool, user_id, OffsetDateTime::now_utc() + Duration::days(2))
            .await;

        service.run_once().await.expect("run");

        let user = store.get_user(user_id).await.expect("user");
        assert_eq!(user.key_balance, 0);
    }
}
