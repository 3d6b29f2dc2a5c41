//! Strategy store adapter: sqlite persistence for strategies, the
//! sector/industry dimension tables, and the alert log/firing sets.
//!
//! Specs cross this boundary in two forms. The API form carries sector and
//! industry *names*; the stored form carries dimension *ids* with the name
//! lists cleared. `names_to_ids` runs before every write, `ids_to_names`
//! after every read, so everything above this module only ever sees names.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use refinery::embed_migrations;
use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashSet;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::spec::StrategySpec;
use crate::vocab::Vocabulary;

embed_migrations!("migrations");

/// A persisted strategy, spec in name form.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub version: i64,
    pub created_at: String,
    pub alert_active: bool,
    pub spec: StrategySpec,
}

pub struct StrategyStore {
    conn: Mutex<Connection>,
}

impl StrategyStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migrations::runner()
            .run(&mut conn)
            .map_err(|e| PipelineError::Store(format!("migrations: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrations::runner()
            .run(&mut conn)
            .map_err(|e| PipelineError::Store(format!("migrations: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    // -- Strategy CRUD ------------------------------------------------------

    pub fn create(
        &self,
        user_id: i64,
        name: &str,
        spec: &StrategySpec,
        vocab: &Vocabulary,
    ) -> Result<i64> {
        let stored = names_to_ids(spec, vocab);
        let spec_json = serde_json::to_string(&stored)
            .map_err(|e| PipelineError::Store(format!("spec serialization: {e}")))?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO strategies (user_id, name, version, alert_active, spec_json, created_at)
             VALUES (?1, ?2, 1, 0, ?3, ?4)",
            params![user_id, name, spec_json, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Update name and/or spec, bumping the version. Ownership is part of
    /// the predicate: zero rows affected reads as not-found-or-forbidden.
    pub fn update(
        &self,
        user_id: i64,
        strategy_id: i64,
        name: Option<&str>,
        spec: Option<&StrategySpec>,
        vocab: &Vocabulary,
    ) -> Result<()> {
        let spec_json = match spec {
            Some(spec) => Some(
                serde_json::to_string(&names_to_ids(spec, vocab))
                    .map_err(|e| PipelineError::Store(format!("spec serialization: {e}")))?,
            ),
            None => None,
        };
        let conn = self.lock();
        let affected = conn.execute(
            "UPDATE strategies
             SET name = COALESCE(?1, name),
                 spec_json = COALESCE(?2, spec_json),
                 version = version + 1
             WHERE id = ?3 AND user_id = ?4",
            params![name, spec_json, strategy_id, user_id],
        )?;
        if affected == 0 {
            return Err(PipelineError::NotFoundOrForbidden);
        }
        Ok(())
    }

    pub fn delete(&self, user_id: i64, strategy_id: i64) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let affected = tx.execute(
            "DELETE FROM strategies WHERE id = ?1 AND user_id = ?2",
            params![strategy_id, user_id],
        )?;
        if affected == 0 {
            return Err(PipelineError::NotFoundOrForbidden);
        }
        tx.execute(
            "DELETE FROM alert_firings WHERE strategy_id = ?1",
            params![strategy_id],
        )?;
        tx.execute(
            "DELETE FROM alert_log WHERE strategy_id = ?1",
            params![strategy_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list(&self, user_id: i64, vocab: &Vocabulary) -> Result<Vec<Strategy>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, version, created_at, alert_active, spec_json
             FROM strategies WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_strategy)?;
        let mut strategies = Vec::new();
        for row in rows {
            strategies.push(finish_strategy(row?, vocab)?);
        }
        Ok(strategies)
    }

    pub fn get(&self, user_id: i64, strategy_id: i64, vocab: &Vocabulary) -> Result<Strategy> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, user_id, name, version, created_at, alert_active, spec_json
                 FROM strategies WHERE id = ?1 AND user_id = ?2",
                params![strategy_id, user_id],
                row_to_strategy,
            )
            .optional()?
            .ok_or(PipelineError::NotFoundOrForbidden)?;
        finish_strategy(row, vocab)
    }

    pub fn set_alert_active(&self, user_id: i64, strategy_id: i64, active: bool) -> Result<()> {
        let conn = self.lock();
        let affected = conn.execute(
            "UPDATE strategies SET alert_active = ?1 WHERE id = ?2 AND user_id = ?3",
            params![i64::from(active), strategy_id, user_id],
        )?;
        if affected == 0 {
            return Err(PipelineError::NotFoundOrForbidden);
        }
        Ok(())
    }

    /// Alert-active strategies across all users, for the scheduler.
    pub fn list_alert_active(&self, vocab: &Vocabulary) -> Result<Vec<Strategy>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, version, created_at, alert_active, spec_json
             FROM strategies WHERE alert_active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_strategy)?;
        let mut strategies = Vec::new();
        for row in rows {
            strategies.push(finish_strategy(row?, vocab)?);
        }
        Ok(strategies)
    }

    // -- Dimension tables ---------------------------------------------------

    pub fn list_sectors(&self) -> Result<Vec<(i64, String)>> {
        self.list_dimension("sectors")
    }

    pub fn list_industries(&self) -> Result<Vec<(i64, String)>> {
        self.list_dimension("industries")
    }

    fn list_dimension(&self, table: &str) -> Result<Vec<(i64, String)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT id, name FROM {table} ORDER BY id"))?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    // -- Alert bookkeeping --------------------------------------------------

    pub fn record_alert(
        &self,
        strategy_id: i64,
        user_id: i64,
        ticker: &str,
        fired_at_ms: i64,
        message: &str,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO alert_log (strategy_id, user_id, ticker, fired_at_ms, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                strategy_id,
                user_id,
                ticker,
                fired_at_ms,
                message,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// The set of instance tokens this strategy has already fired on.
    pub fn firing_keys(&self, strategy_id: i64) -> Result<FxHashSet<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT instance_key FROM alert_firings WHERE strategy_id = ?1")?;
        let rows = stmt.query_map(params![strategy_id], |row| row.get::<_, String>(0))?;
        let mut keys = FxHashSet::default();
        for row in rows {
            keys.insert(row?);
        }
        Ok(keys)
    }

    pub fn add_firings(&self, strategy_id: i64, keys: &[String]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute(
                "INSERT OR IGNORE INTO alert_firings (strategy_id, instance_key) VALUES (?1, ?2)",
                params![strategy_id, key],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn row_to_strategy(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Strategy, String)> {
    Ok((
        Strategy {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            created_at: row.get(4)?,
            alert_active: row.get::<_, i64>(5)? != 0,
            spec: StrategySpec::default(),
        },
        row.get(6)?,
    ))
}

fn finish_strategy((mut strategy, spec_json): (Strategy, String), vocab: &Vocabulary) -> Result<Strategy> {
    let stored: StrategySpec = serde_json::from_str(&spec_json)
        .map_err(|e| PipelineError::Store(format!("spec deserialization: {e}")))?;
    strategy.spec = ids_to_names(&stored, vocab);
    Ok(strategy)
}

// ---------------------------------------------------------------------------
// Name ↔ id round-trip
// ---------------------------------------------------------------------------

/// API form → stored form: sector/industry name lists become id lists and
/// the name lists are cleared. Names the dimension doesn't know are logged
/// and dropped rather than failing the write.
pub fn names_to_ids(spec: &StrategySpec, vocab: &Vocabulary) -> StrategySpec {
    let mut stored = spec.clone();
    for filter in &mut stored.universe.filters {
        let lookup: Option<fn(&Vocabulary, &str) -> Option<i64>> = match filter.attribute.as_str() {
            "sector" => Some(|v, name| v.sector_id(name)),
            "industry" => Some(|v, name| v.industry_id(name)),
            _ => None,
        };
        let Some(lookup) = lookup else { continue };

        filter.include_ids = convert_names(&filter.include, &filter.attribute, |n| {
            lookup(vocab, n)
        });
        filter.exclude_ids = convert_names(&filter.exclude, &filter.attribute, |n| {
            lookup(vocab, n)
        });
        filter.include.clear();
        filter.exclude.clear();
    }
    stored
}

/// Stored form → API form: the inverse substitution. Unknown ids are
/// logged and omitted rather than failing the whole load.
pub fn ids_to_names(spec: &StrategySpec, vocab: &Vocabulary) -> StrategySpec {
    let mut api = spec.clone();
    for filter in &mut api.universe.filters {
        let lookup: Option<fn(&Vocabulary, i64) -> Option<String>> = match filter.attribute.as_str()
        {
            "sector" => Some(|v, id| v.sector_name(id)),
            "industry" => Some(|v, id| v.industry_name(id)),
            _ => None,
        };
        let Some(lookup) = lookup else { continue };

        filter.include = convert_ids(&filter.include_ids, &filter.attribute, |id| {
            lookup(vocab, id)
        });
        filter.exclude = convert_ids(&filter.exclude_ids, &filter.attribute, |id| {
            lookup(vocab, id)
        });
        filter.include_ids.clear();
        filter.exclude_ids.clear();
    }
    api
}

fn convert_names(
    names: &[String],
    attribute: &str,
    lookup: impl Fn(&str) -> Option<i64>,
) -> Vec<i64> {
    names
        .iter()
        .filter_map(|name| {
            let id = lookup(name);
            if id.is_none() {
                tracing::warn!(%attribute, %name, "unknown dimension name dropped");
            }
            id
        })
        .collect()
}

fn convert_ids(
    ids: &[i64],
    attribute: &str,
    lookup: impl Fn(i64) -> Option<String>,
) -> Vec<String> {
    ids.iter()
        .filter_map(|id| {
            let name = lookup(*id);
            if name.is_none() {
                tracing::warn!(%attribute, %id, "unknown dimension id dropped");
            }
            name
        })
        .collect()
}
