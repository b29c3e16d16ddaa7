use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres};
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::db::user_repository::UserRepository;
use crate::models::user::{BillingPeriod, Role, SubscriptionState, SubscriptionStatus, User};

pub struct PostgresUserRepository {
    pub pool: PgPool,
}

const USER_COLUMNS: &str = r#"
    id,
    email,
    password_hash,
    full_name,
    roles,
    stripe_customer_id,
    subscription_id,
    subscription_status,
    plan_name,
    plan_type,
    billing_period,
    current_period_start,
    current_period_end,
    has_active_pass,
    created_at,
    updated_at
"#;

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    password_hash: String,
    full_name: String,
    roles: Vec<String>,
    stripe_customer_id: Option<String>,
    subscription_id: Option<String>,
    subscription_status: String,
    plan_name: Option<String>,
    plan_type: Option<String>,
    billing_period: Option<String>,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    has_active_pass: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        let status = SubscriptionStatus::parse(&row.subscription_status).unwrap_or_else(|| {
            warn!(user_id = %row.id, status = %row.subscription_status, "unknown subscription status in store; treating as inactive");
            SubscriptionStatus::Inactive
        });
        let mut roles: Vec<Role> = row.roles.iter().filter_map(|r| Role::parse(r)).collect();
        if !roles.contains(&Role::Audience) {
            roles.insert(0, Role::Audience);
        }
        roles.sort();
        roles.dedup();

        User {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            full_name: row.full_name,
            roles,
            stripe_customer_id: row.stripe_customer_id,
            subscription: SubscriptionState {
                subscription_id: row.subscription_id,
                status,
                plan_name: row.plan_name,
                plan_type: row.plan_type,
                billing_period: row.billing_period.as_deref().and_then(BillingPeriod::parse),
                current_period_start: row.current_period_start,
                current_period_end: row.current_period_end,
                has_active_pass: row.has_active_pass,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn role_names(roles: &[Role]) -> Vec<String> {
    roles.iter().map(|r| r.as_str().to_string()).collect()
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn create_user(
        &self,
        email: &str,
        full_name: &str,
        password_hash: &str,
    ) -> Result<User, sqlx::Error> {
        let sql = format!(
            "INSERT INTO users (id, email, password_hash, full_name, roles)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query_as::<Postgres, UserRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(email)
            .bind(password_hash)
            .bind(full_name)
            .bind(role_names(&[Role::Audience]))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query_as::<Postgres, UserRow>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(User::from))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)");
        let row = sqlx::query_as::<Postgres, UserRow>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(User::from))
    }

    async fn find_user_id_by_stripe_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<Postgres, Uuid>("SELECT id FROM users WHERE stripe_customer_id = $1")
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn find_user_id_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<Postgres, Uuid>("SELECT id FROM users WHERE subscription_id = $1")
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn set_user_stripe_customer_id(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> Result<(), sqlx::Error> {
        let result = sqlx::query::<Postgres>(
            "UPDATE users SET stripe_customer_id = $2, updated_at = now() WHERE id = $1",
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    async fn write_subscription_state(
        &self,
        user_id: Uuid,
        state: &SubscriptionState,
        roles: &[Role],
    ) -> Result<(), sqlx::Error> {
        let result = sqlx::query::<Postgres>(
            r#"
            UPDATE users
            SET subscription_id = $2,
                subscription_status = $3,
                plan_name = $4,
                plan_type = $5,
                billing_period = $6,
                current_period_start = $7,
                current_period_end = $8,
                has_active_pass = $9,
                roles = $10,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(state.subscription_id.as_deref())
        .bind(state.status.as_str())
        .bind(state.plan_name.as_deref())
        .bind(state.plan_type.as_deref())
        .bind(state.billing_period.map(|p| p.as_str()))
        .bind(state.current_period_start)
        .bind(state.current_period_end)
        .bind(state.has_active_pass)
        .bind(role_names(roles))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    async fn list_expired_active_subscriptions(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<User>, sqlx::Error> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE subscription_status = 'active'
               AND current_period_end IS NOT NULL
               AND current_period_end <= $1
             ORDER BY current_period_end ASC
             LIMIT $2"
        );
        let rows = sqlx::query_as::<Postgres, UserRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn update_user_name(&self, user_id: Uuid, full_name: &str) -> Result<(), sqlx::Error> {
        let result = sqlx::query::<Postgres>(
            "UPDATE users SET full_name = $2, updated_at = now() WHERE id = $1",
        )
        .bind(user_id)
        .bind(full_name)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    async fn update_user_email(&self, user_id: Uuid, email: &str) -> Result<(), sqlx::Error> {
        let result =
            sqlx::query::<Postgres>("UPDATE users SET email = $2, updated_at = now() WHERE id = $1")
                .bind(user_id)
                .bind(email)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    async fn is_email_taken_by_other(
        &self,
        email: &str,
        user_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let taken = sqlx::query_scalar::<Postgres, i32>(
            "SELECT 1 FROM users WHERE lower(email) = lower($1) AND id <> $2",
        )
        .bind(email)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .is_some();
        Ok(taken)
    }
}
