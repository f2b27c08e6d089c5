use std::time::Duration;

use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    Postgres, QueryBuilder,
};
use time::{Date, OffsetDateTime};
use tokio::sync::RwLock;

use super::{LedgerStore, PurgeStats, StoreError, UpsertStats};
use crate::domain::{
    DailyUsageRecord, EnergyMode, LinkState, MonthlyUsageRecord, StatusChangeEvent, TelemetryPoint,
    Unit,
};

/// Postgres binds at most 65535 parameters per statement.
const MAX_ROWS_PER_STATEMENT: usize = 1000;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// PostgreSQL-backed ledger.
///
/// The pool sits behind a lock so `reconnect` can swap in a fresh one while
/// in-flight callers finish on the old handle. Schema lives in
/// `sql/schema/01_ledger_tables.sql` and is applied out-of-band.
pub struct PgLedger {
    uri: String,
    max_connections: u32,
    pool: RwLock<PgPool>,
}

impl PgLedger {
    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = open_pool(uri, max_connections).await?;
        Ok(Self {
            uri: uri.to_string(),
            max_connections,
            pool: RwLock::new(pool),
        })
    }

    async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }
}

async fn open_pool(uri: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(uri)
        .await?;
    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct TelemetryRow {
    unit_key: String,
    energy_mode: String,
    counter_value: i64,
    source_address: Option<String>,
    captured_day: Date,
    success: bool,
    message: String,
}

impl TelemetryRow {
    fn into_point(self) -> Option<TelemetryPoint> {
        let energy_mode = parse_mode(&self.unit_key, &self.energy_mode)?;
        Some(TelemetryPoint {
            unit: Unit::parse(&self.unit_key),
            energy_mode,
            raw_counter_value: self.counter_value,
            source_address: self.source_address,
            captured_day: self.captured_day,
            success: self.success,
            message: self.message,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DailyRow {
    unit_key: String,
    energy_mode: String,
    day: Date,
    initial_energy: i64,
    final_energy: Option<i64>,
    usage_quantity: Option<i64>,
}

impl DailyRow {
    fn into_record(self) -> Option<DailyUsageRecord> {
        let energy_mode = parse_mode(&self.unit_key, &self.energy_mode)?;
        Some(DailyUsageRecord {
            unit: Unit::parse(&self.unit_key),
            energy_mode,
            day: self.day,
            initial_energy: self.initial_energy,
            final_energy: self.final_energy,
            usage_quantity: self.usage_quantity,
        })
    }
}

fn parse_mode(unit_key: &str, raw: &str) -> Option<EnergyMode> {
    match raw.parse() {
        Ok(mode) => Some(mode),
        Err(e) => {
            tracing::warn!(unit = unit_key, error = %e, "skipping ledger row with unknown energy mode");
            None
        }
    }
}

fn count_inserted(inserted: &[bool]) -> UpsertStats {
    let created = inserted.iter().filter(|fresh| **fresh).count() as u64;
    UpsertStats {
        created,
        updated: inserted.len() as u64 - created,
    }
}

#[async_trait::async_trait]
impl LedgerStore for PgLedger {
    async fn upsert_telemetry(&self, points: &[TelemetryPoint]) -> Result<UpsertStats, StoreError> {
        if points.is_empty() {
            return Ok(UpsertStats::default());
        }

        let pool = self.pool().await;
        let mut tx = pool.begin().await?;
        let mut stats = UpsertStats::default();
        let now = OffsetDateTime::now_utc();

        for chunk in points.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO telemetry_point (unit_key, building, section, floor, room, energy_mode, \
                 counter_value, source_address, captured_day, success, message, updated_at) ",
            );
            builder.push_values(chunk, |mut b, p| {
                b.push_bind(&p.unit.key)
                    .push_bind(&p.unit.building)
                    .push_bind(&p.unit.section)
                    .push_bind(&p.unit.floor)
                    .push_bind(&p.unit.room)
                    .push_bind(p.energy_mode.as_str())
                    .push_bind(p.raw_counter_value)
                    .push_bind(&p.source_address)
                    .push_bind(p.captured_day)
                    .push_bind(p.success)
                    .push_bind(&p.message)
                    .push_bind(now);
            });
            builder.push(
                " ON CONFLICT (unit_key, energy_mode, captured_day) DO UPDATE SET \
                 counter_value = EXCLUDED.counter_value, \
                 source_address = EXCLUDED.source_address, \
                 success = EXCLUDED.success, \
                 message = EXCLUDED.message, \
                 building = EXCLUDED.building, \
                 section = EXCLUDED.section, \
                 floor = EXCLUDED.floor, \
                 room = EXCLUDED.room, \
                 updated_at = EXCLUDED.updated_at \
                 RETURNING (xmax = 0) AS inserted",
            );

            let inserted: Vec<bool> = builder.build_query_scalar().fetch_all(&mut *tx).await?;
            stats += count_inserted(&inserted);
        }

        tx.commit().await?;
        Ok(stats)
    }

    async fn telemetry_for_day(&self, day: Date) -> Result<Vec<TelemetryPoint>, StoreError> {
        let pool = self.pool().await;
        let rows = sqlx::query_as::<_, TelemetryRow>(
            r#"
            SELECT
                unit_key,
                energy_mode,
                counter_value,
                source_address,
                captured_day,
                success,
                message
            FROM telemetry_point
            WHERE captured_day = $1
              AND success
            ORDER BY unit_key, energy_mode
            "#,
        )
        .bind(day)
        .fetch_all(&pool)
        .await?;

        Ok(rows.into_iter().filter_map(TelemetryRow::into_point).collect())
    }

    async fn copy_telemetry(&self, from: Date, to: Date) -> Result<u64, StoreError> {
        let pool = self.pool().await;
        let result = sqlx::query(
            r#"
            INSERT INTO telemetry_point (
                unit_key, building, section, floor, room, energy_mode,
                counter_value, source_address, captured_day, success, message, updated_at
            )
            SELECT
                unit_key, building, section, floor, room, energy_mode,
                counter_value, source_address, $2, success, message, $3
            FROM telemetry_point
            WHERE captured_day = $1
              AND success
            ON CONFLICT (unit_key, energy_mode, captured_day) DO NOTHING
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(OffsetDateTime::now_utc())
        .execute(&pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn daily_between(&self, start: Date, end: Date) -> Result<Vec<DailyUsageRecord>, StoreError> {
        let pool = self.pool().await;
        let rows = sqlx::query_as::<_, DailyRow>(
            r#"
            SELECT
                unit_key,
                energy_mode,
                day,
                initial_energy,
                final_energy,
                usage_quantity
            FROM daily_usage
            WHERE day >= $1
              AND day <  $2
            ORDER BY unit_key, energy_mode, day
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&pool)
        .await?;

        Ok(rows.into_iter().filter_map(DailyRow::into_record).collect())
    }

    async fn upsert_daily(&self, records: &[DailyUsageRecord]) -> Result<UpsertStats, StoreError> {
        if records.is_empty() {
            return Ok(UpsertStats::default());
        }

        let pool = self.pool().await;
        let mut tx = pool.begin().await?;
        let mut stats = UpsertStats::default();
        let now = OffsetDateTime::now_utc();

        for chunk in records.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO daily_usage (unit_key, building, section, room, energy_mode, day, \
                 initial_energy, final_energy, usage_quantity, updated_at) ",
            );
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(&r.unit.key)
                    .push_bind(&r.unit.building)
                    .push_bind(&r.unit.section)
                    .push_bind(&r.unit.room)
                    .push_bind(r.energy_mode.as_str())
                    .push_bind(r.day)
                    .push_bind(r.initial_energy)
                    .push_bind(r.final_energy)
                    .push_bind(r.usage_quantity)
                    .push_bind(now);
            });
            builder.push(
                " ON CONFLICT (unit_key, energy_mode, day) DO UPDATE SET \
                 initial_energy = EXCLUDED.initial_energy, \
                 final_energy = EXCLUDED.final_energy, \
                 usage_quantity = EXCLUDED.usage_quantity, \
                 updated_at = EXCLUDED.updated_at \
                 RETURNING (xmax = 0) AS inserted",
            );

            let inserted: Vec<bool> = builder.build_query_scalar().fetch_all(&mut *tx).await?;
            stats += count_inserted(&inserted);
        }

        tx.commit().await?;
        Ok(stats)
    }

    async fn close_silent_days(&self, day: Date) -> Result<u64, StoreError> {
        let pool = self.pool().await;
        let result = sqlx::query(
            r#"
            UPDATE daily_usage
            SET final_energy = initial_energy,
                usage_quantity = 0,
                updated_at = $2
            WHERE day = $1
              AND final_energy IS NULL
            "#,
        )
        .bind(day)
        .bind(OffsetDateTime::now_utc())
        .execute(&pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn upsert_monthly(&self, record: &MonthlyUsageRecord) -> Result<UpsertStats, StoreError> {
        let pool = self.pool().await;
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO monthly_usage (
                unit_key, building, section, room, energy_mode, usage_month,
                initial_energy, final_energy, usage_quantity, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (unit_key, energy_mode, usage_month) DO UPDATE SET
                building = EXCLUDED.building,
                section = EXCLUDED.section,
                room = EXCLUDED.room,
                initial_energy = EXCLUDED.initial_energy,
                final_energy = EXCLUDED.final_energy,
                usage_quantity = EXCLUDED.usage_quantity,
                updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.unit.key)
        .bind(&record.unit.building)
        .bind(&record.unit.section)
        .bind(&record.unit.room)
        .bind(record.energy_mode.as_str())
        .bind(record.month.to_string())
        .bind(record.initial_energy)
        .bind(record.final_energy)
        .bind(record.usage_quantity)
        .bind(OffsetDateTime::now_utc())
        .fetch_one(&pool)
        .await?;

        Ok(count_inserted(&[inserted]))
    }

    async fn purge_before(&self, day: Date) -> Result<PurgeStats, StoreError> {
        let pool = self.pool().await;
        let mut tx = pool.begin().await?;

        let telemetry = sqlx::query("DELETE FROM telemetry_point WHERE captured_day < $1")
            .bind(day)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let daily = sqlx::query("DELETE FROM daily_usage WHERE day < $1")
            .bind(day)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(PurgeStats { telemetry, daily })
    }

    async fn record_link_state(
        &self,
        unit: &Unit,
        state: LinkState,
        at: OffsetDateTime,
    ) -> Result<Option<StatusChangeEvent>, StoreError> {
        let pool = self.pool().await;
        let mut tx = pool.begin().await?;

        let previous: Option<String> =
            sqlx::query_scalar("SELECT status FROM connection_status WHERE unit_key = $1 FOR UPDATE")
                .bind(&unit.key)
                .fetch_optional(&mut *tx)
                .await?;
        let changed = previous.as_deref() != Some(state.as_str());
        let last_online = (state == LinkState::Online).then_some(at);

        sqlx::query(
            r#"
            INSERT INTO connection_status (
                unit_key, building, section, room, status, last_online_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (unit_key) DO UPDATE SET
                building = EXCLUDED.building,
                section = EXCLUDED.section,
                room = EXCLUDED.room,
                status = EXCLUDED.status,
                last_online_at = COALESCE(EXCLUDED.last_online_at, connection_status.last_online_at),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&unit.key)
        .bind(&unit.building)
        .bind(&unit.section)
        .bind(&unit.room)
        .bind(state.as_str())
        .bind(last_online)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        let event = if changed {
            sqlx::query(
                "INSERT INTO status_change_history (unit_key, building, section, room, status, changed_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&unit.key)
            .bind(&unit.building)
            .bind(&unit.section)
            .bind(&unit.room)
            .bind(state.as_str())
            .bind(at)
            .execute(&mut *tx)
            .await?;

            Some(StatusChangeEvent {
                unit: unit.clone(),
                state,
                changed_at: at,
            })
        } else {
            None
        };

        tx.commit().await?;
        Ok(event)
    }

    async fn mark_stale_offline(
        &self,
        cutoff: OffsetDateTime,
        at: OffsetDateTime,
    ) -> Result<Vec<StatusChangeEvent>, StoreError> {
        let pool = self.pool().await;
        let mut tx = pool.begin().await?;

        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE connection_status
            SET status = 'offline',
                updated_at = $2
            WHERE status = 'online'
              AND last_online_at < $1
            RETURNING unit_key
            "#,
        )
        .bind(cutoff)
        .bind(at)
        .fetch_all(&mut *tx)
        .await?;

        let events: Vec<StatusChangeEvent> = keys
            .iter()
            .map(|key| StatusChangeEvent {
                unit: Unit::parse(key),
                state: LinkState::Offline,
                changed_at: at,
            })
            .collect();

        for chunk in events.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO status_change_history (unit_key, building, section, room, status, changed_at) ",
            );
            builder.push_values(chunk, |mut b, e| {
                b.push_bind(&e.unit.key)
                    .push_bind(&e.unit.building)
                    .push_bind(&e.unit.section)
                    .push_bind(&e.unit.room)
                    .push_bind(e.state.as_str())
                    .push_bind(e.changed_at);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(events)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let pool = self.pool().await;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let fresh = open_pool(&self.uri, self.max_connections).await?;
        let stale = std::mem::replace(&mut *self.pool.write().await, fresh);
        stale.close().await;
        tracing::info!("storage pool reopened");
        Ok(())
    }
}
