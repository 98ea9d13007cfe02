use async_trait::async_trait;
use paddock_core::{MarketPrices, Region, ReconciledRace, ReconciledRunner};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

use crate::{BatchTransaction, DimensionKey, DimensionKind, DimensionName, RaceStore, StoreError};

// Keeps each multi-row statement well under the 65535 bind-parameter limit.
const ROWS_PER_STATEMENT: usize = 500;

const PRICE_SUFFIXES: [&str; 10] = [
    "bsp",
    "ppwap",
    "morning_wap",
    "pp_max",
    "pp_min",
    "ip_max",
    "ip_min",
    "morning_vol",
    "pp_vol",
    "ip_vol",
];

fn market_values(prices: &MarketPrices) -> [Option<f64>; 10] {
    [
        prices.bsp,
        prices.ppwap,
        prices.morning_wap,
        prices.pp_max,
        prices.pp_min,
        prices.ip_max,
        prices.ip_min,
        prices.morning_traded_vol,
        prices.pp_traded_vol,
        prices.ip_traded_vol,
    ]
}

fn price_columns() -> impl Iterator<Item = String> {
    ["win", "place"]
        .into_iter()
        .flat_map(|market| PRICE_SUFFIXES.iter().map(move |s| format!("{market}_{s}")))
}

fn as_i32(value: Option<u32>) -> Option<i32> {
    value.and_then(|v| i32::try_from(v).ok())
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RaceStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn BatchTransaction + '_>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "CREATE TEMP TABLE paddock_staging (\
                 kind TEXT NOT NULL, \
                 name_key TEXT NOT NULL, \
                 name TEXT NOT NULL, \
                 region TEXT, \
                 seq BIGSERIAL\
             ) ON COMMIT DROP",
        )
        .execute(&mut *tx)
        .await?;
        Ok(Box::new(PgBatch { tx }))
    }
}

struct PgBatch {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BatchTransaction for PgBatch {
    async fn stage_dimension_names(
        &mut self,
        kind: DimensionKind,
        names: &[DimensionName],
    ) -> Result<(), StoreError> {
        let keys: Vec<String> = names.iter().map(|n| n.key.name_key.clone()).collect();
        let displays: Vec<String> = names.iter().map(|n| n.display.clone()).collect();
        let regions: Vec<String> = names
            .iter()
            .map(|n| n.key.region.map(|r| r.as_str().to_string()).unwrap_or_default())
            .collect();

        sqlx::query(
            "INSERT INTO paddock_staging (kind, name_key, name, region) \
             SELECT $1, k, n, NULLIF(r, '') \
             FROM UNNEST($2::text[], $3::text[], $4::text[]) WITH ORDINALITY AS t(k, n, r, i) \
             ORDER BY i",
        )
        .bind(kind.table())
        .bind(&keys)
        .bind(&displays)
        .bind(&regions)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_missing_dimensions(&mut self, kind: DimensionKind) -> Result<u64, StoreError> {
        let sql = match kind {
            DimensionKind::Course => "INSERT INTO courses (name, region, name_key) \
                 SELECT DISTINCT ON (name_key, region) name, region, name_key \
                 FROM paddock_staging WHERE kind = $1 \
                 ORDER BY name_key, region, seq \
                 ON CONFLICT (name_key, region) DO NOTHING"
                .to_string(),
            other => format!(
                "INSERT INTO {table} (name, name_key) \
                 SELECT DISTINCT ON (name_key) name, name_key \
                 FROM paddock_staging WHERE kind = $1 \
                 ORDER BY name_key, seq \
                 ON CONFLICT (name_key) DO NOTHING",
                table = other.table()
            ),
        };
        let result = sqlx::query(&sql)
            .bind(kind.table())
            .execute(&mut *self.tx)
            .await?;
        debug!(table = kind.table(), inserted = result.rows_affected(), "dimension insert");
        Ok(result.rows_affected())
    }

    async fn select_staged_dimension_ids(
        &mut self,
        kind: DimensionKind,
    ) -> Result<Vec<(DimensionKey, i64)>, StoreError> {
        let sql = match kind {
            DimensionKind::Course => "SELECT d.id, d.name_key, d.region FROM courses d \
                 JOIN (SELECT DISTINCT name_key, region FROM paddock_staging WHERE kind = $1) s \
                   ON s.name_key = d.name_key AND s.region = d.region"
                .to_string(),
            other => format!(
                "SELECT d.id, d.name_key, NULL::text AS region FROM {table} d \
                 JOIN (SELECT DISTINCT name_key FROM paddock_staging WHERE kind = $1) s \
                   ON s.name_key = d.name_key",
                table = other.table()
            ),
        };
        let rows = sqlx::query(&sql)
            .bind(kind.table())
            .fetch_all(&mut *self.tx)
            .await?;

        let mut resolved = Vec::with_capacity(rows.len());
        for row in rows {
            let region: Option<String> = row.try_get("region")?;
            resolved.push((
                DimensionKey {
                    name_key: row.try_get("name_key")?,
                    region: region.as_deref().and_then(|r| Region::from_source(r).ok()),
                },
                row.try_get::<i64, _>("id")?,
            ));
        }
        Ok(resolved)
    }

    async fn upsert_races(&mut self, races: &[ReconciledRace]) -> Result<u64, StoreError> {
        let mut written = 0;
        for chunk in races.chunks(ROWS_PER_STATEMENT) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO races (race_key, race_date, region, course, course_id, off_time, \
                 race_name, race_type, handicap, distance, going, race_class, price_event_id, \
                 match_tier, match_jaccard, match_time_diff) ",
            );
            qb.push_values(chunk, |mut b, race| {
                b.push_bind(&race.race_key)
                    .push_bind(race.date)
                    .push_bind(race.region.as_str())
                    .push_bind(&race.course)
                    .push_bind(race.course_id)
                    .push_bind(&race.off_time)
                    .push_bind(&race.race_name)
                    .push_bind(race.race_type.as_str())
                    .push_bind(race.handicap)
                    .push_bind(&race.distance)
                    .push_bind(&race.going)
                    .push_bind(&race.race_class)
                    .push_bind(&race.price_event_id)
                    .push_bind(race.confidence.map(|c| c.tier.as_str()))
                    .push_bind(race.confidence.map(|c| c.jaccard))
                    .push_bind(race.confidence.map(|c| c.time_diff_minutes as i32));
            });
            qb.push(
                " ON CONFLICT (race_key) DO UPDATE SET \
                 course = EXCLUDED.course, \
                 course_id = COALESCE(EXCLUDED.course_id, races.course_id), \
                 race_name = EXCLUDED.race_name, \
                 handicap = EXCLUDED.handicap, \
                 distance = COALESCE(EXCLUDED.distance, races.distance), \
                 going = COALESCE(EXCLUDED.going, races.going), \
                 race_class = COALESCE(EXCLUDED.race_class, races.race_class), \
                 price_event_id = COALESCE(EXCLUDED.price_event_id, races.price_event_id), \
                 match_tier = COALESCE(EXCLUDED.match_tier, races.match_tier), \
                 match_jaccard = COALESCE(EXCLUDED.match_jaccard, races.match_jaccard), \
                 match_time_diff = COALESCE(EXCLUDED.match_time_diff, races.match_time_diff), \
                 updated_at = now()",
            );
            written += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(written)
    }

    async fn upsert_runners(&mut self, races: &[ReconciledRace]) -> Result<u64, StoreError> {
        let rows: Vec<(&str, &ReconciledRunner)> = races
            .iter()
            .flat_map(|race| race.runners.iter().map(move |r| (race.race_key.as_str(), r)))
            .collect();

        let price_columns: Vec<String> = price_columns().collect();
        let coalesce_prices = price_columns
            .iter()
            .map(|c| format!("{c} = COALESCE(EXCLUDED.{c}, runners.{c})"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut written = 0;
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO runners (runner_key, race_key, horse_id, jockey_id, trainer_id, \
                 owner_id, horse_name, saddle_number, draw, position, weight_lbs, \
                 official_rating, rpr, ts, comment, {}) ",
                price_columns.join(", ")
            ));
            qb.push_values(chunk, |mut b, (race_key, runner)| {
                let result = &runner.result;
                let ids = runner.dimension_ids;
                b.push_bind(&runner.runner_key)
                    .push_bind(*race_key)
                    .push_bind(ids.horse_id)
                    .push_bind(ids.jockey_id)
                    .push_bind(ids.trainer_id)
                    .push_bind(ids.owner_id)
                    .push_bind(&result.horse)
                    .push_bind(as_i32(result.number))
                    .push_bind(as_i32(result.draw))
                    .push_bind(&result.position)
                    .push_bind(as_i32(result.weight_lbs))
                    .push_bind(as_i32(result.official_rating))
                    .push_bind(as_i32(result.rpr))
                    .push_bind(as_i32(result.ts))
                    .push_bind(&result.comment);
                let prices = runner.prices.unwrap_or_default();
                for value in market_values(&prices.win)
                    .into_iter()
                    .chain(market_values(&prices.place))
                {
                    b.push_bind(value);
                }
            });
            qb.push(format!(
                " ON CONFLICT (runner_key) DO UPDATE SET \
                 horse_id = COALESCE(EXCLUDED.horse_id, runners.horse_id), \
                 jockey_id = COALESCE(EXCLUDED.jockey_id, runners.jockey_id), \
                 trainer_id = COALESCE(EXCLUDED.trainer_id, runners.trainer_id), \
                 owner_id = COALESCE(EXCLUDED.owner_id, runners.owner_id), \
                 horse_name = EXCLUDED.horse_name, \
                 position = EXCLUDED.position, \
                 weight_lbs = EXCLUDED.weight_lbs, \
                 official_rating = EXCLUDED.official_rating, \
                 rpr = EXCLUDED.rpr, \
                 ts = EXCLUDED.ts, \
                 comment = EXCLUDED.comment, \
                 {coalesce_prices}, \
                 updated_at = now()"
            ));
            written += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(written)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use paddock_core::names::name_key;
    use paddock_core::{PriceFields, RaceType, ResultsRace, ResultsRunner};
    use uuid::Uuid;

    /// Live-database tests run only when DATABASE_URL points at a scratch Postgres.
    async fn store_from_env() -> Option<PgStore> {
        let database_url = std::env::var("DATABASE_URL").ok()?;
        let store = PgStore::connect(&database_url).await.ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    /// A one-runner race whose keys are unique to this test run.
    fn race_with_bsp(tag: &str, bsp: Option<f64>) -> ReconciledRace {
        let mut race = ReconciledRace::from_results(ResultsRace {
            date: NaiveDate::from_ymd_opt(2024, 1, 13).unwrap(),
            region: Region::Gb,
            course: "Ascot".into(),
            off_time: "14:30".into(),
            race_name: format!("Stakes {tag}"),
            race_type: RaceType::Flat,
            distance: None,
            going: None,
            race_class: None,
            runners: vec![ResultsRunner {
                horse: "Frankel".into(),
                number: Some(1),
                ..Default::default()
            }],
        });
        race.runners[0].prices = Some(PriceFields {
            win: MarketPrices {
                bsp,
                ..Default::default()
            },
            place: MarketPrices::default(),
        });
        race
    }

    async fn stored_win_bsp(store: &PgStore, runner_key: &str) -> Option<f64> {
        sqlx::query_scalar("SELECT win_bsp FROM runners WHERE runner_key = $1")
            .bind(runner_key)
            .fetch_one(&store.pool)
            .await
            .unwrap()
    }

    #[test]
    fn price_columns_cover_both_markets_in_bind_order() {
        let columns: Vec<String> = price_columns().collect();
        assert_eq!(columns.len(), 20);
        assert_eq!(columns[0], "win_bsp");
        assert_eq!(columns[10], "place_bsp");
        assert_eq!(columns[19], "place_ip_vol");
        assert_eq!(market_values(&MarketPrices::default()), [None; 10]);
    }

    #[test]
    fn oversized_numbers_bind_as_null() {
        assert_eq!(as_i32(Some(12)), Some(12));
        assert_eq!(as_i32(Some(u32::MAX)), None);
        assert_eq!(as_i32(None), None);
    }

    #[tokio::test]
    async fn null_price_never_overwrites_a_stored_one() {
        let Some(store) = store_from_env().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        let tag = Uuid::new_v4().simple().to_string();
        let runner_key = race_with_bsp(&tag, None).runners[0].runner_key.clone();

        for (bsp, expected) in [(Some(4.5), Some(4.5)), (None, Some(4.5)), (Some(5.0), Some(5.0))] {
            let races = vec![race_with_bsp(&tag, bsp)];
            let mut tx = store.begin().await.unwrap();
            tx.upsert_races(&races).await.unwrap();
            tx.upsert_runners(&races).await.unwrap();
            tx.commit().await.unwrap();
            assert_eq!(stored_win_bsp(&store, &runner_key).await, expected);
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM runners WHERE runner_key = $1")
            .bind(&runner_key)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn dimensions_resolve_to_one_row_per_key_and_keep_the_first_spelling() {
        let Some(store) = store_from_env().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        let tag = Uuid::new_v4().simple().to_string();
        let first = format!("zed {tag}");
        let second = format!("Zed {tag} (IRE)");
        let staged: Vec<DimensionName> = [&first, &second]
            .into_iter()
            .map(|raw| DimensionName {
                key: DimensionKey::for_name(raw),
                display: raw.clone(),
            })
            .collect();

        let mut tx = store.begin().await.unwrap();
        tx.stage_dimension_names(DimensionKind::Horse, &staged).await.unwrap();
        assert_eq!(tx.insert_missing_dimensions(DimensionKind::Horse).await.unwrap(), 1);
        let ids = tx.select_staged_dimension_ids(DimensionKind::Horse).await.unwrap();
        tx.commit().await.unwrap();
        assert!(!ids.is_empty());
        assert!(ids.iter().all(|(_, id)| *id == ids[0].1));

        let mut tx = store.begin().await.unwrap();
        tx.stage_dimension_names(DimensionKind::Horse, &staged[1..]).await.unwrap();
        assert_eq!(tx.insert_missing_dimensions(DimensionKind::Horse).await.unwrap(), 0);
        let again = tx.select_staged_dimension_ids(DimensionKind::Horse).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(again[0].1, ids[0].1);

        let stored: String = sqlx::query_scalar("SELECT name FROM horses WHERE id = $1")
            .bind(ids[0].1)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(stored, first);
    }

    #[tokio::test]
    async fn sql_name_key_agrees_with_the_application_key() {
        let Some(store) = store_from_env().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        for raw in [
            "Horse-II",
            "A (IRE) II",
            "Vazirani II.",
            "Kingman (IRE)",
            "O\u{2019}Brien",
            "  Dé Jà Vû  ",
            "Mr. Smith-Jones,",
            "Lightning (Brave Boy)",
            "V",
        ] {
            let sql: String = sqlx::query_scalar("SELECT paddock_name_key($1)")
                .bind(raw)
                .fetch_one(&store.pool)
                .await
                .unwrap();
            assert_eq!(sql, name_key(raw), "{raw}");
        }
    }
}
