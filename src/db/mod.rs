// Record store adapter (SQLite via sqlx).
//
// Species and evolution chains are stored as opaque JSON documents keyed by
// id; daily picks are append-only. Every operation is bounded by `op_timeout`.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeZone};
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::{ServiceError, ServiceResult};
use crate::sampler::IdRange;

/// How `GET /pokemons/name/{name}` matches names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameMatch {
    Exact,
    /// Case-insensitive prefix match.
    Prefix,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Species {
    pub id: i64,
    pub name: String,
    pub evolution_chain_id: Option<i64>,
    /// The full document, passed through untouched.
    pub data: Value,
}

#[derive(sqlx::FromRow)]
struct SpeciesRow {
    id: i64,
    name: String,
    evolution_chain_id: Option<i64>,
    data: String,
}

impl TryFrom<SpeciesRow> for Species {
    type Error = ServiceError;

    fn try_from(row: SpeciesRow) -> Result<Self, Self::Error> {
        Ok(Species {
            id: row.id,
            name: row.name,
            evolution_chain_id: row.evolution_chain_id,
            data: serde_json::from_str(&row.data)?,
        })
    }
}

/// A persisted daily pick, as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPick {
    /// Store-assigned sequence number, used as the ordering tie-break.
    #[serde(skip)]
    pub seq: i64,
    pub pokemon: Value,
    /// RFC 3339 timestamp with the local offset at creation time.
    pub date: String,
    pub game_id: i64,
}

#[derive(sqlx::FromRow)]
struct DailyPickRow {
    id: i64,
    game_id: i64,
    date: String,
    pokemon: String,
}

impl TryFrom<DailyPickRow> for DailyPick {
    type Error = ServiceError;

    fn try_from(row: DailyPickRow) -> Result<Self, Self::Error> {
        Ok(DailyPick {
            seq: row.id,
            pokemon: serde_json::from_str(&row.pokemon)?,
            date: row.date,
            game_id: row.game_id,
        })
    }
}

const SPECIES_COLUMNS: &str = "id, name, evolution_chain_id, data";

pub struct Database {
    pool: SqlitePool,
    op_timeout: Duration,
}

impl Database {
    pub async fn new(database_url: &str, op_timeout: Duration) -> ServiceResult<Self> {
        let connect = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(op_timeout)
            .connect(database_url);
        let pool = match tokio::time::timeout(op_timeout, connect).await {
            Ok(pool) => pool?,
            Err(_) => {
                return Err(ServiceError::StoreUnavailable(format!(
                    "connecting to {database_url} timed out after {op_timeout:?}"
                )))
            }
        };
        let db = Self { pool, op_timeout };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> ServiceResult<()> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS pokemon (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                evolution_chain_id INTEGER,
                data TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_pokemon_name ON pokemon(name)",
            r#"
            CREATE TABLE IF NOT EXISTS evolution_chains (
                id INTEGER PRIMARY KEY,
                data TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS daily_pokemon (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                game_id INTEGER NOT NULL,
                date TEXT NOT NULL,
                date_ms INTEGER NOT NULL,
                pokemon TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_daily_pokemon_recency ON daily_pokemon(game_id, date_ms, id)",
        ] {
            self.bounded("migrate", sqlx::query(ddl).execute(&self.pool))
                .await?;
        }
        Ok(())
    }

    /// Run one store operation under the configured timeout.
    async fn bounded<T, F>(&self, op: &str, fut: F) -> ServiceResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(_) => Err(ServiceError::StoreUnavailable(format!(
                "{op} timed out after {:?}",
                self.op_timeout
            ))),
        }
    }

    // ── Species ───────────────────────────────────────────────────────

    /// Upsert a species document. The document must carry an integer `id`
    /// and a string `name`; `evolution_chain_id` is optional.
    pub async fn insert_species(&self, doc: &Value) -> ServiceResult<Species> {
        let id = doc
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ServiceError::Validation("species document needs an integer id".into()))?;
        let name = doc
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::Validation("species document needs a name".into()))?;
        let evolution_chain_id = doc.get("evolution_chain_id").and_then(Value::as_i64);

        self.bounded(
            "insert_species",
            sqlx::query(
                "INSERT OR REPLACE INTO pokemon (id, name, evolution_chain_id, data) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(name)
            .bind(evolution_chain_id)
            .bind(doc.to_string())
            .execute(&self.pool),
        )
        .await?;

        Ok(Species {
            id,
            name: name.to_string(),
            evolution_chain_id,
            data: doc.clone(),
        })
    }

    pub async fn list_species(&self) -> ServiceResult<Vec<Species>> {
        let sql = format!("SELECT {SPECIES_COLUMNS} FROM pokemon ORDER BY id");
        let rows = self
            .bounded(
                "list_species",
                sqlx::query_as::<_, SpeciesRow>(&sql).fetch_all(&self.pool),
            )
            .await?;
        rows.into_iter().map(Species::try_from).collect()
    }

    pub async fn get_species(&self, id: i64) -> ServiceResult<Option<Species>> {
        let sql = format!("SELECT {SPECIES_COLUMNS} FROM pokemon WHERE id = ?");
        let row = self
            .bounded(
                "get_species",
                sqlx::query_as::<_, SpeciesRow>(&sql)
                    .bind(id)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.map(Species::try_from).transpose()
    }

    pub async fn find_species_by_name(
        &self,
        name: &str,
        mode: NameMatch,
    ) -> ServiceResult<Vec<Species>> {
        let (sql, pattern) = match mode {
            NameMatch::Exact => (
                format!("SELECT {SPECIES_COLUMNS} FROM pokemon WHERE name = ? ORDER BY id"),
                name.to_string(),
            ),
            // SQLite's LIKE is case-insensitive for ASCII.
            NameMatch::Prefix => (
                format!(
                    "SELECT {SPECIES_COLUMNS} FROM pokemon WHERE name LIKE ? ESCAPE '\\' ORDER BY id"
                ),
                format!("{}%", escape_like(name)),
            ),
        };
        let rows = self
            .bounded(
                "find_species_by_name",
                sqlx::query_as::<_, SpeciesRow>(&sql)
                    .bind(pattern)
                    .fetch_all(&self.pool),
            )
            .await?;
        rows.into_iter().map(Species::try_from).collect()
    }

    /// Number of species documents whose id lies inside `range`.
    pub async fn count_species_in_range(&self, range: IdRange) -> ServiceResult<i64> {
        self.bounded(
            "count_species_in_range",
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pokemon WHERE id >= ? AND id <= ?")
                .bind(range.lo)
                .bind(range.hi)
                .fetch_one(&self.pool),
        )
        .await
    }

    /// The `offset`-th species (0-based, ascending id) inside `range`.
    pub async fn species_at_offset(
        &self,
        range: IdRange,
        offset: i64,
    ) -> ServiceResult<Option<Species>> {
        let sql = format!(
            "SELECT {SPECIES_COLUMNS} FROM pokemon WHERE id >= ? AND id <= ? ORDER BY id LIMIT 1 OFFSET ?"
        );
        let row = self
            .bounded(
                "species_at_offset",
                sqlx::query_as::<_, SpeciesRow>(&sql)
                    .bind(range.lo)
                    .bind(range.hi)
                    .bind(offset)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.map(Species::try_from).transpose()
    }

    // ── Evolution chains ──────────────────────────────────────────────

    pub async fn insert_evolution_chain(&self, id: i64, doc: &Value) -> ServiceResult<()> {
        self.bounded(
            "insert_evolution_chain",
            sqlx::query("INSERT OR REPLACE INTO evolution_chains (id, data) VALUES (?, ?)")
                .bind(id)
                .bind(doc.to_string())
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    pub async fn get_evolution_chain(&self, id: i64) -> ServiceResult<Option<Value>> {
        let data = self
            .bounded(
                "get_evolution_chain",
                sqlx::query_scalar::<_, String>("SELECT data FROM evolution_chains WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&self.pool),
            )
            .await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    // ── Daily picks ───────────────────────────────────────────────────

    pub async fn insert_daily_pick<Tz>(
        &self,
        game_id: i64,
        pokemon: &Value,
        date: &DateTime<Tz>,
    ) -> ServiceResult<DailyPick>
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let row = self
            .bounded(
                "insert_daily_pick",
                sqlx::query_as::<_, DailyPickRow>(
                    "INSERT INTO daily_pokemon (game_id, date, date_ms, pokemon) VALUES (?, ?, ?, ?) RETURNING id, game_id, date, pokemon",
                )
                .bind(game_id)
                .bind(date.to_rfc3339())
                .bind(date.timestamp_millis())
                .bind(pokemon.to_string())
                .fetch_one(&self.pool),
            )
            .await?;
        DailyPick::try_from(row)
    }

    /// Up to `limit` picks for a slot, most recent first. Ties on the
    /// instant fall back to insertion order.
    pub async fn recent_daily_picks(
        &self,
        game_id: i64,
        limit: i64,
    ) -> ServiceResult<Vec<DailyPick>> {
        let rows = self
            .bounded(
                "recent_daily_picks",
                sqlx::query_as::<_, DailyPickRow>(
                    "SELECT id, game_id, date, pokemon FROM daily_pokemon WHERE game_id = ? ORDER BY date_ms DESC, id DESC LIMIT ?",
                )
                .bind(game_id)
                .bind(limit)
                .fetch_all(&self.pool),
            )
            .await?;
        rows.into_iter().map(DailyPick::try_from).collect()
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
