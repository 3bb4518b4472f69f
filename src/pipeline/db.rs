//! SQLite persistence: catalog, state checkpoints and alert log
//!
//! Tables (see `/sql/`):
//! - `markets` - UPSERT on id, capped by recency
//! - `market_state` - UPSERT on series_id, cascades with its market
//! - `alerts` - INSERT (append-only), cascades with its market

use super::error::PipelineError;
use super::scorer::ScoreBreakdown;
use super::signals::CandidateAlert;
use super::state::SeriesState;
use super::types::MarketSnapshot;
use super::welford::{OnlineEstimator, SIGMA_FLOOR};
use super::windows::TrajectoryBuffer;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Save/load contract for detection state
///
/// Each series is written as one whole record; a partially written state
/// is never visible to `load_all`.
pub trait StateStore: Send + Sync {
    /// Every persisted state, keyed by series id
    fn load_all(&self) -> Result<HashMap<String, SeriesState>, PipelineError>;

    fn save(&self, series_id: &str, state: &SeriesState) -> Result<(), PipelineError>;
}

/// Catalog side of persistence used by the cycle runner
pub trait CatalogStore: Send + Sync {
    /// Insert or refresh a market, then enforce the cap
    ///
    /// Returns the ids evicted by the cap.
    fn upsert_market(&self, snapshot: &MarketSnapshot) -> Result<Vec<String>, PipelineError>;

    /// Enforce the cap, returning the evicted ids
    fn rotate_markets(&self) -> Result<Vec<String>, PipelineError>;

    /// Append to the alert log
    fn record_alert(&self, alert: &CandidateAlert, notified: bool) -> Result<(), PipelineError>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir`, sorted by name, and executes
/// them. Every file must use "IF NOT EXISTS" so reruns are harmless.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), PipelineError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(PipelineError::Database(format!(
            "Schema directory not found: {}",
            schema_dir
        )));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let io_err = |e: std::io::Error| PipelineError::Database(format!("{}: {}", schema_dir, e));

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path).map_err(io_err)?;
        conn.execute_batch(&sql_content)?;
        log::info!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

/// SQLite-backed catalog, state and alert store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    max_markets: usize,
}

impl SqliteStore {
    /// Open (or create) the database and bring the schema up to date
    ///
    /// The parent directory of `db_path` is created when missing.
    pub fn open(db_path: &Path, schema_dir: &str, max_markets: usize) -> Result<Self, PipelineError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::Database(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let mut conn = Connection::open(db_path)?;
        run_schema_migrations(&mut conn, schema_dir)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        log::info!("🗄️  Opened store at {} (max {} markets)", db_path.display(), max_markets);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_markets: max_markets.max(1),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PipelineError> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Database("connection mutex poisoned".to_string()))
    }

    pub fn max_markets(&self) -> usize {
        self.max_markets
    }

    pub fn get_market(&self, id: &str) -> Result<Option<MarketSnapshot>, PipelineError> {
        let conn = self.lock()?;
        let market = conn
            .query_row(
                r#"
                SELECT id, event_id, market_id, market_question, title, event_url, category,
                       yes_probability, no_probability, volume_24h, volume_1wk, volume_1mo,
                       liquidity, active, closed, last_updated, created_at
                FROM markets WHERE id = ?
                "#,
                [id],
                row_to_snapshot,
            )
            .optional()?;
        Ok(market)
    }

    pub fn market_count(&self) -> Result<usize, PipelineError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM markets", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Highest-scoring logged alerts, best first
    pub fn top_alerts(&self, k: usize) -> Result<Vec<CandidateAlert>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT series_id, event_title, event_url, market_question,
                   final_score, hellinger, liquidity_pressure, instant_energy, trajectory_consistency,
                   old_probability, new_probability, probability_delta, volume_delta, liquidity, detected_at
            FROM alerts ORDER BY final_score DESC, id ASC LIMIT ?
            "#,
        )?;

        let rows = stmt.query_map([k as i64], |row| {
            Ok(CandidateAlert {
                series_id: row.get(0)?,
                event_title: row.get(1)?,
                event_url: row.get(2)?,
                market_question: row.get(3)?,
                score: ScoreBreakdown {
                    final_score: row.get(4)?,
                    hellinger: row.get(5)?,
                    liquidity_pressure: row.get(6)?,
                    instant_energy: row.get(7)?,
                    trajectory_consistency: row.get(8)?,
                },
                old_probability: row.get(9)?,
                new_probability: row.get(10)?,
                probability_delta: row.get(11)?,
                volume_delta: row.get(12)?,
                liquidity: row.get(13)?,
                detected_at: row.get(14)?,
            })
        })?;

        let mut alerts = Vec::new();
        for alert in rows {
            alerts.push(alert?);
        }
        Ok(alerts)
    }

    /// Logged alerts that were delivered
    pub fn notified_alert_count(&self) -> Result<usize, PipelineError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM alerts WHERE notified = 1", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Delete everything past the cap, oldest `last_updated` first
    fn enforce_cap(conn: &Connection, max_markets: usize) -> Result<Vec<String>, PipelineError> {
        let mut stmt = conn.prepare(
            r#"
            SELECT id FROM markets
            ORDER BY last_updated DESC, id ASC
            LIMIT -1 OFFSET ?
            "#,
        )?;
        let evicted: Vec<String> = stmt
            .query_map([max_markets as i64], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        for id in &evicted {
            conn.execute("DELETE FROM markets WHERE id = ?", [id])?;
        }
        Ok(evicted)
    }
}

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<MarketSnapshot> {
    Ok(MarketSnapshot {
        id: row.get(0)?,
        event_id: row.get(1)?,
        market_id: row.get(2)?,
        market_question: row.get(3)?,
        title: row.get(4)?,
        event_url: row.get(5)?,
        category: row.get(6)?,
        yes_probability: row.get(7)?,
        no_probability: row.get(8)?,
        volume_24h: row.get(9)?,
        volume_1wk: row.get(10)?,
        volume_1mo: row.get(11)?,
        liquidity: row.get(12)?,
        active: row.get(13)?,
        closed: row.get(14)?,
        last_updated: row.get(15)?,
        created_at: row.get(16)?,
    })
}

impl StateStore for SqliteStore {
    fn load_all(&self) -> Result<HashMap<String, SeriesState>, PipelineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT series_id, welford_count, welford_mean, welford_m2, avg_depth,
                   tc_buffer, tc_index, tc_capacity,
                   last_probability, last_sigma, last_volume, updated_at
            FROM market_state
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, f64>(8)?,
                row.get::<_, f64>(9)?,
                row.get::<_, f64>(10)?,
                row.get::<_, i64>(11)?,
            ))
        })?;

        let mut states = HashMap::new();
        for row in rows {
            let (
                series_id,
                count,
                mean,
                m2,
                avg_depth,
                tc_json,
                tc_index,
                tc_capacity,
                last_probability,
                last_sigma,
                last_volume,
                updated_at,
            ) = row?;

            let values: Vec<f64> = match serde_json::from_str(&tc_json) {
                Ok(values) => values,
                Err(e) => {
                    log::warn!("⚠️  Skipping state for {}: bad trajectory buffer: {}", series_id, e);
                    continue;
                }
            };

            let state = SeriesState {
                series_id: series_id.clone(),
                estimator: OnlineEstimator::from_parts(count.max(0) as u64, mean, m2),
                avg_depth,
                trajectory: TrajectoryBuffer::from_parts(
                    values,
                    tc_index.max(0) as usize,
                    tc_capacity.max(1) as usize,
                ),
                last_probability,
                last_sigma: last_sigma.max(SIGMA_FLOOR),
                last_volume,
                updated_at,
            };
            states.insert(series_id, state);
        }

        Ok(states)
    }

    fn save(&self, series_id: &str, state: &SeriesState) -> Result<(), PipelineError> {
        let tc_json = serde_json::to_string(state.trajectory.values())?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO market_state (
                series_id, welford_count, welford_mean, welford_m2, avg_depth,
                tc_buffer, tc_index, tc_capacity,
                last_probability, last_sigma, last_volume, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(series_id) DO UPDATE SET
                welford_count = excluded.welford_count,
                welford_mean = excluded.welford_mean,
                welford_m2 = excluded.welford_m2,
                avg_depth = excluded.avg_depth,
                tc_buffer = excluded.tc_buffer,
                tc_index = excluded.tc_index,
                tc_capacity = excluded.tc_capacity,
                last_probability = excluded.last_probability,
                last_sigma = excluded.last_sigma,
                last_volume = excluded.last_volume,
                updated_at = excluded.updated_at
            "#,
            params![
                series_id,
                state.estimator.count() as i64,
                state.estimator.mean(),
                state.estimator.m2(),
                state.avg_depth,
                tc_json,
                state.trajectory.index() as i64,
                state.trajectory.capacity() as i64,
                state.last_probability,
                state.last_sigma,
                state.last_volume,
                state.updated_at,
            ],
        )?;
        Ok(())
    }
}

impl CatalogStore for SqliteStore {
    fn upsert_market(&self, snapshot: &MarketSnapshot) -> Result<Vec<String>, PipelineError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO markets (
                id, event_id, market_id, market_question, title, event_url, category,
                yes_probability, no_probability, volume_24h, volume_1wk, volume_1mo,
                liquidity, active, closed, last_updated, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                market_question = excluded.market_question,
                title = excluded.title,
                event_url = excluded.event_url,
                category = excluded.category,
                yes_probability = excluded.yes_probability,
                no_probability = excluded.no_probability,
                volume_24h = excluded.volume_24h,
                volume_1wk = excluded.volume_1wk,
                volume_1mo = excluded.volume_1mo,
                liquidity = excluded.liquidity,
                active = excluded.active,
                closed = excluded.closed,
                last_updated = excluded.last_updated
            "#,
            params![
                snapshot.id,
                snapshot.event_id,
                snapshot.market_id,
                snapshot.market_question,
                snapshot.title,
                snapshot.event_url,
                snapshot.category,
                snapshot.yes_probability,
                snapshot.no_probability,
                snapshot.volume_24h,
                snapshot.volume_1wk,
                snapshot.volume_1mo,
                snapshot.liquidity,
                snapshot.active,
                snapshot.closed,
                snapshot.last_updated,
                snapshot.created_at,
            ],
        )?;

        let evicted = Self::enforce_cap(&tx, self.max_markets)?;
        tx.commit()?;
        Ok(evicted)
    }

    fn rotate_markets(&self) -> Result<Vec<String>, PipelineError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let evicted = Self::enforce_cap(&tx, self.max_markets)?;
        tx.commit()?;

        if !evicted.is_empty() {
            log::info!("🧹 Rotated {} markets out of the catalog", evicted.len());
        }
        Ok(evicted)
    }

    fn record_alert(&self, alert: &CandidateAlert, notified: bool) -> Result<(), PipelineError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO alerts (
                series_id, event_title, event_url, market_question,
                final_score, hellinger, liquidity_pressure, instant_energy, trajectory_consistency,
                old_probability, new_probability, probability_delta, volume_delta, liquidity,
                detected_at, notified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                alert.series_id,
                alert.event_title,
                alert.event_url,
                alert.market_question,
                alert.score.final_score,
                alert.score.hellinger,
                alert.score.liquidity_pressure,
                alert.score.instant_energy,
                alert.score.trajectory_consistency,
                alert.old_probability,
                alert.new_probability,
                alert.probability_delta,
                alert.volume_delta,
                alert.liquidity,
                alert.detected_at,
                notified,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::fixtures::snapshot;
    use tempfile::TempDir;

    const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

    fn create_test_store(max_markets: usize) -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.db"), SCHEMA_DIR, max_markets).unwrap();
        (dir, store)
    }

    fn market_at(id: &str, last_updated: i64) -> MarketSnapshot {
        let mut s = snapshot(id, 0.5, 100_000.0, 50_000.0);
        s.created_at = last_updated - 10;
        s.last_updated = last_updated;
        s
    }

    fn sample_state(id: &str) -> SeriesState {
        let mut state = SeriesState::new(id.to_string(), 3);
        state.initialize(&snapshot(id, 0.4, 100_000.0, 50_000.0), 100);
        state.update_baseline(0.45, 52_000.0, 0.1);
        for v in [1.5, -0.5, 2.0, 3.0] {
            state.trajectory.push(v);
        }
        state.last_probability = 0.45;
        state.last_sigma = 0.035;
        state.updated_at = 160;
        state
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("oddsflow.db");
        let store = SqliteStore::open(&path, SCHEMA_DIR, 10).unwrap();
        drop(store);
        let store = SqliteStore::open(&path, SCHEMA_DIR, 10).unwrap();
        assert_eq!(store.market_count().unwrap(), 0);
    }

    #[test]
    fn test_missing_schema_dir_is_error() {
        let dir = TempDir::new().unwrap();
        let result = SqliteStore::open(&dir.path().join("x.db"), "/definitely/not/here", 10);
        assert!(matches!(result, Err(PipelineError::Database(_))));
    }

    #[test]
    fn test_upsert_and_get_market() {
        let (_dir, store) = create_test_store(10);
        let mut market = market_at("evt:1", 1_000);
        assert!(store.upsert_market(&market).unwrap().is_empty());

        market.yes_probability = 0.6;
        market.no_probability = 0.4;
        market.last_updated = 2_000;
        store.upsert_market(&market).unwrap();

        let loaded = store.get_market("evt:1").unwrap().unwrap();
        assert_eq!(loaded.yes_probability, 0.6);
        assert_eq!(loaded.last_updated, 2_000);
        assert_eq!(loaded.created_at, 990);
        assert_eq!(store.market_count().unwrap(), 1);
        assert!(store.get_market("evt:missing").unwrap().is_none());
    }

    #[test]
    fn test_state_round_trip() {
        let (_dir, store) = create_test_store(10);
        store.upsert_market(&market_at("evt:1", 1_000)).unwrap();

        let state = sample_state("evt:1");
        store.save("evt:1", &state).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["evt:1"], state);
    }

    #[test]
    fn test_save_overwrites_previous_checkpoint() {
        let (_dir, store) = create_test_store(10);
        store.upsert_market(&market_at("evt:1", 1_000)).unwrap();

        let mut state = sample_state("evt:1");
        store.save("evt:1", &state).unwrap();
        state.trajectory.push(9.0);
        state.updated_at = 999;
        store.save("evt:1", &state).unwrap();

        assert_eq!(store.load_all().unwrap()["evt:1"], state);
    }

    #[test]
    fn test_state_requires_catalog_row() {
        let (_dir, store) = create_test_store(10);
        let result = store.save("evt:orphan", &sample_state("evt:orphan"));
        assert!(result.is_err());
    }

    #[test]
    fn test_cap_evicts_least_recent_and_cascades() {
        let (_dir, store) = create_test_store(3);
        for (i, id) in ["e:a", "e:b", "e:c"].iter().enumerate() {
            store.upsert_market(&market_at(id, 1_000 + i as i64)).unwrap();
            store.save(id, &sample_state(id)).unwrap();
        }

        let evicted = store.upsert_market(&market_at("e:d", 2_000)).unwrap();
        assert_eq!(evicted, vec!["e:a".to_string()]);
        assert_eq!(store.market_count().unwrap(), 3);
        assert!(store.get_market("e:a").unwrap().is_none());

        let states = store.load_all().unwrap();
        assert!(!states.contains_key("e:a"));
        assert_eq!(states.len(), 2);
    }

    #[test]
    fn test_alert_log_ordered_by_score() {
        let (_dir, store) = create_test_store(10);
        store.upsert_market(&market_at("e:a", 1_000)).unwrap();

        for score in [4.0, 12.0, 7.5] {
            let alert = CandidateAlert {
                series_id: "e:a".to_string(),
                event_title: "Event".to_string(),
                event_url: String::new(),
                market_question: "Q".to_string(),
                score: ScoreBreakdown {
                    final_score: score,
                    ..Default::default()
                },
                old_probability: 0.4,
                new_probability: 0.6,
                probability_delta: 0.2,
                volume_delta: 10.0,
                liquidity: 5_000.0,
                detected_at: 1_000,
            };
            store.record_alert(&alert, score > 5.0).unwrap();
        }

        let top = store.top_alerts(2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].final_score(), 12.0);
        assert_eq!(top[1].final_score(), 7.5);
    }
}
