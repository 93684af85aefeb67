//! Durable, transactional record of recommendations, executions, monitoring
//! samples, and decision chains. One `rusqlite::Connection` behind an async
//! mutex, WAL journal mode — same shape as the vault store this is grounded
//! on, generalized from a single-row vault ledger to the full recommendation
//! lifecycle schema.

use crate::domain::{
    ChainDecision, DecisionChain, Direction, Execution, ExitReason, MonitoringSample,
    Recommendation, RecommendationSource, RecommendationStatus,
};
use crate::error::{EngineError, EngineResult};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct ActiveFilter {
    pub symbol: Option<String>,
    pub direction: Option<Direction>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub symbol: Option<String>,
    pub status: Option<RecommendationStatus>,
    pub ab_group: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RecommendationPatch {
    pub current_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub effective_stop_price: Option<f64>,
    pub best_favourable_price: Option<f64>,
    pub tp1_hit: Option<bool>,
    pub tp2_hit: Option<bool>,
    pub tp3_hit: Option<bool>,
    pub reduction_count: Option<u32>,
    pub reduction_ratio: Option<f64>,
    pub ev_ok: Option<bool>,
    pub close_pending: Option<bool>,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open recommendation store")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory recommendation store")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS recommendations (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_recommendations_status ON recommendations(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_recommendations_symbol_dir ON recommendations(symbol, direction)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                recommendation_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_rec ON executions(recommendation_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS monitoring_samples (
                id TEXT PRIMARY KEY,
                recommendation_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                check_time TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_samples_rec ON monitoring_samples(recommendation_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS decision_chains (
                chain_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chains_symbol ON decision_chains(symbol)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chains_status ON decision_chains(status)",
            [],
        )?;
        Ok(())
    }

    // -- recommendations ---------------------------------------------------

    pub async fn insert_recommendation(&self, rec: &Recommendation) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let payload = serde_json::to_string(rec).context("serialize recommendation")?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM recommendations WHERE id = ?1",
                params![rec.id],
                |row| row.get(0),
            )
            .optional()
            .context("check duplicate id")?;
        if existing.is_some() {
            return Err(EngineError::Validation(format!(
                "recommendation id '{}' already exists",
                rec.id
            )));
        }
        conn.execute(
            "INSERT INTO recommendations (id, payload, symbol, direction, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rec.id,
                payload,
                rec.symbol,
                rec.direction.as_str(),
                status_str(rec.status),
                rec.created_at.to_rfc3339(),
                rec.updated_at.to_rfc3339(),
            ],
        )
        .context("insert recommendation")?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> EngineResult<Option<Recommendation>> {
        let conn = self.conn.lock().await;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM recommendations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("load recommendation")?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p).context("decode recommendation")?)),
            None => Ok(None),
        }
    }

    pub async fn update_recommendation(
        &self,
        id: &str,
        patch: RecommendationPatch,
    ) -> EngineResult<Recommendation> {
        let mut rec = self
            .get(id)
            .await?
            .ok_or(EngineError::NotFound)?;

        if let Some(v) = patch.current_price {
            rec.current_price = v;
        }
        if let Some(v) = patch.stop_loss_price {
            rec.stop_loss_price = v;
        }
        if let Some(v) = patch.take_profit_price {
            rec.take_profit_price = v;
        }
        if let Some(v) = patch.effective_stop_price {
            rec.effective_stop_price = v;
        }
        if let Some(v) = patch.best_favourable_price {
            rec.best_favourable_price = v;
        }
        if let Some(v) = patch.tp1_hit {
            rec.tp1_hit = rec.tp1_hit || v;
        }
        if let Some(v) = patch.tp2_hit {
            rec.tp2_hit = rec.tp2_hit || v;
        }
        if let Some(v) = patch.tp3_hit {
            rec.tp3_hit = rec.tp3_hit || v;
        }
        if let Some(v) = patch.reduction_count {
            rec.reduction_count = rec.reduction_count.max(v);
        }
        if let Some(v) = patch.reduction_ratio {
            rec.reduction_ratio = v;
        }
        if let Some(v) = patch.ev_ok {
            rec.ev_ok = Some(v);
        }
        if let Some(v) = patch.close_pending {
            rec.close_pending = v;
        }
        rec.updated_at = Utc::now();

        self.persist_row(&rec).await?;
        Ok(rec)
    }

    /// Sets terminal status only if current status is ACTIVE; otherwise a
    /// no-op that returns `NotActive` without disturbing the persisted row.
    #[allow(clippy::too_many_arguments)]
    pub async fn close_recommendation(
        &self,
        id: &str,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
        label: Option<String>,
        pnl_percent: f64,
        pnl_amount: f64,
    ) -> EngineResult<Recommendation> {
        let mut rec = self.get(id).await?.ok_or(EngineError::NotFound)?;
        if rec.status != RecommendationStatus::Active {
            return Err(EngineError::NotActive);
        }
        rec.status = RecommendationStatus::Closed;
        rec.exit_price = Some(exit_price);
        rec.exit_time = Some(exit_time);
        rec.exit_reason = Some(reason);
        rec.exit_label = label.or_else(|| Some(format!("{reason:?}")));
        rec.pnl_percent = Some(pnl_percent);
        rec.pnl_amount = Some(pnl_amount);
        rec.close_pending = false;
        rec.updated_at = Utc::now();
        self.persist_row(&rec).await?;
        Ok(rec)
    }

    pub async fn expire_recommendation(
        &self,
        id: &str,
        reason: Option<String>,
    ) -> EngineResult<Recommendation> {
        let mut rec = self.get(id).await?.ok_or(EngineError::NotFound)?;
        if rec.status != RecommendationStatus::Active {
            return Err(EngineError::NotActive);
        }
        rec.status = RecommendationStatus::Expired;
        rec.exit_reason = Some(ExitReason::Timeout);
        rec.exit_label = reason.or_else(|| Some("TIMEOUT".to_string()));
        rec.exit_time = Some(Utc::now());
        rec.exit_price = rec.exit_price.or(Some(rec.current_price));
        rec.updated_at = Utc::now();
        self.persist_row(&rec).await?;
        Ok(rec)
    }

    async fn persist_row(&self, rec: &Recommendation) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let payload = serde_json::to_string(rec).context("serialize recommendation")?;
        conn.execute(
            "UPDATE recommendations SET payload = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                payload,
                status_str(rec.status),
                rec.updated_at.to_rfc3339(),
                rec.id,
            ],
        )
        .context("persist recommendation row")?;
        Ok(())
    }

    pub async fn list_active(&self, filter: ActiveFilter) -> EngineResult<Vec<Recommendation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT payload FROM recommendations WHERE status = 'ACTIVE' ORDER BY created_at ASC")
            .context("prepare list_active")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("query list_active")?;
        let mut out = Vec::new();
        for row in rows {
            let payload = row.context("read list_active row")?;
            let rec: Recommendation = serde_json::from_str(&payload).context("decode recommendation")?;
            if let Some(sym) = &filter.symbol {
                if &rec.symbol != sym {
                    continue;
                }
            }
            if let Some(dir) = filter.direction {
                if rec.direction != dir {
                    continue;
                }
            }
            out.push(rec);
        }
        Ok(out)
    }

    pub async fn query(
        &self,
        filter: QueryFilter,
        page: usize,
        limit: usize,
    ) -> EngineResult<Vec<Recommendation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT payload FROM recommendations ORDER BY created_at DESC")
            .context("prepare query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("query recommendations")?;
        let mut matched = Vec::new();
        for row in rows {
            let payload = row.context("read query row")?;
            let rec: Recommendation = serde_json::from_str(&payload).context("decode recommendation")?;
            if let Some(sym) = &filter.symbol {
                if &rec.symbol != sym {
                    continue;
                }
            }
            if let Some(status) = filter.status {
                if rec.status != status {
                    continue;
                }
            }
            if let Some(ab) = &filter.ab_group {
                if rec.ab_group.as_deref() != Some(ab.as_str()) {
                    continue;
                }
            }
            matched.push(rec);
        }
        let start = page.saturating_mul(limit.max(1));
        Ok(matched.into_iter().skip(start).take(limit.max(1)).collect())
    }

    // -- executions ---------------------------------------------------------

    pub async fn save_execution(&self, exec: &Execution) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let payload = serde_json::to_string(exec).context("serialize execution")?;
        conn.execute(
            "INSERT INTO executions (id, recommendation_id, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                exec.id,
                exec.recommendation_id,
                payload,
                exec.intended_timestamp.to_rfc3339(),
            ],
        )
        .context("insert execution")?;
        Ok(())
    }

    // -- monitoring samples ---------------------------------------------------

    pub async fn save_monitoring_sample(&self, sample: &MonitoringSample) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let payload = serde_json::to_string(sample).context("serialize monitoring sample")?;
        conn.execute(
            "INSERT INTO monitoring_samples (id, recommendation_id, payload, check_time) VALUES (?1, ?2, ?3, ?4)",
            params![
                sample.id,
                sample.recommendation_id,
                payload,
                sample.check_time.to_rfc3339(),
            ],
        )
        .context("insert monitoring sample")?;
        Ok(())
    }

    // -- decision chains ------------------------------------------------------

    pub async fn save_decision_chain(&self, chain: &DecisionChain) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let payload = serde_json::to_string(chain).context("serialize decision chain")?;
        conn.execute(
            "INSERT INTO decision_chains (chain_id, symbol, status, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(chain_id) DO UPDATE SET
                status = excluded.status,
                payload = excluded.payload",
            params![
                chain.chain_id,
                chain.symbol,
                chain_decision_str(chain.final_decision),
                payload,
                chain.created_at.to_rfc3339(),
            ],
        )
        .context("upsert decision chain")?;
        Ok(())
    }

    pub async fn get_decision_chain(&self, id: &str) -> EngineResult<Option<DecisionChain>> {
        let conn = self.conn.lock().await;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM decision_chains WHERE chain_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("load decision chain")?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p).context("decode decision chain")?)),
            None => Ok(None),
        }
    }

    pub async fn query_decision_chains(
        &self,
        symbol: Option<&str>,
        status: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<DecisionChain>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT payload FROM decision_chains ORDER BY created_at DESC")
            .context("prepare query_decision_chains")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("query decision chains")?;
        let mut matched = Vec::new();
        for row in rows {
            let payload = row.context("read chain row")?;
            let chain: DecisionChain = serde_json::from_str(&payload).context("decode decision chain")?;
            if let Some(sym) = symbol {
                if chain.symbol != sym {
                    continue;
                }
            }
            if let Some(status) = status {
                if chain_decision_str(chain.final_decision) != status {
                    continue;
                }
            }
            matched.push(chain);
        }
        Ok(matched.into_iter().skip(offset).take(limit.max(1)).collect())
    }
}

fn status_str(status: RecommendationStatus) -> &'static str {
    match status {
        RecommendationStatus::Active => "ACTIVE",
        RecommendationStatus::Closed => "CLOSED",
        RecommendationStatus::Expired => "EXPIRED",
    }
}

fn chain_decision_str(d: ChainDecision) -> &'static str {
    match d {
        ChainDecision::Approved => "APPROVED",
        ChainDecision::Rejected => "REJECTED",
        ChainDecision::Pending => "PENDING",
    }
}

// Re-exported so callers constructing filters don't need to import
// `std::str::FromStr` themselves just to parse a direction from a query
// string.
pub fn parse_direction(s: &str) -> EngineResult<Direction> {
    Direction::from_str(s)
}

pub fn default_source() -> RecommendationSource {
    RecommendationSource::Manual
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, RecommendationMetadata, RecommendationStatus};

    fn sample_rec(id: &str) -> Recommendation {
        let now = Utc::now();
        Recommendation {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: 1000.0,
            current_price: 1000.0,
            leverage: 2.0,
            position_size: 1.0,
            stop_loss_price: 950.0,
            take_profit_price: 1100.0,
            trailing_override: None,
            atr_value: 10.0,
            atr_period: 14,
            atr_sl_multiplier: 2.0,
            atr_tp_multiplier: 3.0,
            tp1_hit: false,
            tp2_hit: false,
            tp3_hit: false,
            reduction_count: 0,
            reduction_ratio: 0.0,
            expected_return: None,
            ev: None,
            ev_threshold: None,
            ev_ok: None,
            status: RecommendationStatus::Active,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            exit_label: None,
            pnl_percent: None,
            pnl_amount: None,
            effective_stop_price: 950.0,
            best_favourable_price: 1000.0,
            close_pending: false,
            created_at: now,
            updated_at: now,
            source: None,
            strategy_type: None,
            ab_group: None,
            experiment_id: None,
            dedupe_key: None,
            metadata: RecommendationMetadata::default(),
        }
    }

    #[tokio::test]
    async fn insert_then_get_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        let rec = sample_rec("r1");
        store.insert_recommendation(&rec).await.unwrap();
        let loaded = store.get("r1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "r1");
        assert_eq!(loaded.status, RecommendationStatus::Active);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let rec = sample_rec("r1");
        store.insert_recommendation(&rec).await.unwrap();
        let err = store.insert_recommendation(&rec).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent_no_op_when_already_terminal() {
        let store = Store::open_in_memory().unwrap();
        let rec = sample_rec("r1");
        store.insert_recommendation(&rec).await.unwrap();
        let now = Utc::now();
        store
            .close_recommendation("r1", 1050.0, now, ExitReason::TakeProfit, None, 10.0, 100.0)
            .await
            .unwrap();
        let err = store
            .close_recommendation("r1", 1060.0, now, ExitReason::TakeProfit, None, 12.0, 120.0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotActive));
    }

    #[tokio::test]
    async fn list_active_excludes_closed_rows() {
        let store = Store::open_in_memory().unwrap();
        let rec = sample_rec("r1");
        store.insert_recommendation(&rec).await.unwrap();
        store
            .close_recommendation("r1", 1050.0, Utc::now(), ExitReason::TakeProfit, None, 10.0, 100.0)
            .await
            .unwrap();
        let active = store.list_active(ActiveFilter::default()).await.unwrap();
        assert!(active.is_empty());
    }

    /// Exercises the on-disk path (`Store::open`, WAL pragmas, directory
    /// creation) rather than `open_in_memory`, and that a second `Store`
    /// opened against the same file sees what the first one persisted.
    #[tokio::test]
    async fn on_disk_store_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("recommendations.db");
        let db_path = db_path.to_str().unwrap();

        let store = Store::open(db_path).unwrap();
        store.insert_recommendation(&sample_rec("r1")).await.unwrap();
        drop(store);

        let reopened = Store::open(db_path).unwrap();
        let fetched = reopened.get("r1").await.unwrap();
        assert!(fetched.is_some());
        assert_eq!(fetched.unwrap().id, "r1");
    }
}
