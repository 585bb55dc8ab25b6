//! Persistent entity records and their value history.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use rusqlite::{params, Row};

use crate::db::{parse_datetime, to_i64, to_u64, Database};

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub identifier: String,
    pub display_name: Option<String>,
    pub group_name: Option<String>,
    pub avatar_url: Option<String>,
    pub region_id: Option<i64>,
    pub level: Option<i64>,
    pub level_label: Option<String>,
    pub latest_value: Option<u64>,
    pub latest_rank: Option<u32>,
    pub first_seen: DateTime<Local>,
    pub last_seen: DateTime<Local>,
}

/// Fields written by one upsert. Empty or missing values keep what is stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityUpdate {
    pub identifier: String,
    pub display_name: Option<String>,
    pub group_name: Option<String>,
    pub avatar_url: Option<String>,
    pub region_id: Option<i64>,
    pub level: Option<i64>,
    pub level_label: Option<String>,
    pub value: Option<u64>,
    pub rank: Option<u32>,
}

pub trait EntityStore: Send + Sync {
    fn find_entity(&self, identifier: &str) -> Result<Option<EntityRecord>>;

    fn upsert_entity(&self, update: &EntityUpdate, seen_at: DateTime<Local>) -> Result<()>;

    /// Returns `false` when the same (identifier, timestamp) point already exists.
    fn insert_history_point(
        &self,
        identifier: &str,
        value: u64,
        rank: Option<u32>,
        observed_at: DateTime<Local>,
    ) -> Result<bool>;
}

fn row_to_entity(row: &Row) -> Result<EntityRecord> {
    let latest_value: Option<i64> = row.get("latest_value")?;
    let latest_rank: Option<i64> = row.get("latest_rank")?;
    let first_seen: String = row.get("first_seen")?;
    let last_seen: String = row.get("last_seen")?;

    Ok(EntityRecord {
        identifier: row.get("identifier")?,
        display_name: row.get("display_name")?,
        group_name: row.get("group_name")?,
        avatar_url: row.get("avatar_url")?,
        region_id: row.get("region_id")?,
        level: row.get("level")?,
        level_label: row.get("level_label")?,
        latest_value: latest_value.map(|v| to_u64(v, "latest_value")).transpose()?,
        latest_rank: latest_rank.map(|r| to_u64(r, "latest_rank").map(|r| r as u32)).transpose()?,
        first_seen: parse_datetime(&first_seen, "first_seen")?,
        last_seen: parse_datetime(&last_seen, "last_seen")?,
    })
}

impl EntityStore for Database {
    fn find_entity(&self, identifier: &str) -> Result<Option<EntityRecord>> {
        let identifier = identifier.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT identifier, display_name, group_name, avatar_url, region_id, level,
                        level_label, latest_value, latest_rank, first_seen, last_seen
                 FROM entities WHERE identifier = ?1",
            )?;
            let mut rows = stmt.query(params![identifier])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_entity(row)?)),
                None => Ok(None),
            }
        })
    }

    fn upsert_entity(&self, update: &EntityUpdate, seen_at: DateTime<Local>) -> Result<()> {
        let update = update.clone();
        let seen_at = seen_at.to_rfc3339();
        let value = update.value.map(to_i64).transpose()?;

        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO entities
                 (identifier, display_name, group_name, avatar_url, region_id, level, level_label,
                  latest_value, latest_rank, first_seen, last_seen)
                 VALUES (?1, NULLIF(?2, ''), NULLIF(?3, ''), NULLIF(?4, ''), ?5, ?6, NULLIF(?7, ''), ?8, ?9, ?10, ?10)
                 ON CONFLICT(identifier) DO UPDATE SET
                     display_name = COALESCE(NULLIF(excluded.display_name, ''), entities.display_name),
                     group_name = COALESCE(NULLIF(excluded.group_name, ''), entities.group_name),
                     avatar_url = COALESCE(NULLIF(excluded.avatar_url, ''), entities.avatar_url),
                     region_id = COALESCE(excluded.region_id, entities.region_id),
                     level = COALESCE(excluded.level, entities.level),
                     level_label = COALESCE(NULLIF(excluded.level_label, ''), entities.level_label),
                     latest_value = COALESCE(excluded.latest_value, entities.latest_value),
                     latest_rank = COALESCE(excluded.latest_rank, entities.latest_rank),
                     last_seen = excluded.last_seen",
                params![
                    update.identifier,
                    update.display_name,
                    update.group_name,
                    update.avatar_url,
                    update.region_id,
                    update.level,
                    update.level_label,
                    value,
                    update.rank,
                    seen_at,
                ],
            )
            .with_context(|| format!("failed to upsert entity {}", update.identifier))?;
            Ok(())
        })
    }

    fn insert_history_point(
        &self,
        identifier: &str,
        value: u64,
        rank: Option<u32>,
        observed_at: DateTime<Local>,
    ) -> Result<bool> {
        let identifier = identifier.to_string();
        let value = to_i64(value)?;
        let observed_at = observed_at.to_rfc3339();

        self.execute(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO value_history (identifier, numeric_value, rank, observed_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![identifier, value, rank, observed_at],
                )
                .with_context(|| format!("failed to insert history point for {identifier}"))?;
            Ok(inserted > 0)
        })
    }
}

/// Number of history points stored for `identifier`.
#[cfg(test)]
pub fn history_len(db: &Database, identifier: &str) -> Result<u64> {
    let identifier = identifier.to_string();
    db.execute(move |conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM value_history WHERE identifier = ?1",
            params![identifier],
            |row| row.get(0),
        )?;
        to_u64(count, "count")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn update(identifier: &str) -> EntityUpdate {
        EntityUpdate {
            identifier: identifier.to_string(),
            display_name: Some("Warden".to_string()),
            group_name: Some("[ABC] Wolves".to_string()),
            region_id: Some(241),
            value: Some(88_421_000),
            rank: Some(12),
            ..EntityUpdate::default()
        }
    }

    #[test]
    fn test_upsert_inserts_then_keeps_existing_fields() {
        let db = Database::open_in_memory().unwrap();
        let first = Local::now();
        db.upsert_entity(&update("111629384"), first).unwrap();

        let later = first + Duration::minutes(5);
        db.upsert_entity(
            &EntityUpdate {
                identifier: "111629384".to_string(),
                display_name: Some(String::new()),
                value: Some(90_000_000),
                ..EntityUpdate::default()
            },
            later,
        )
        .unwrap();

        let entity = db.find_entity("111629384").unwrap().unwrap();
        assert_eq!(entity.display_name.as_deref(), Some("Warden"));
        assert_eq!(entity.group_name.as_deref(), Some("[ABC] Wolves"));
        assert_eq!(entity.region_id, Some(241));
        assert_eq!(entity.latest_value, Some(90_000_000));
        assert_eq!(entity.latest_rank, Some(12));
        assert_eq!(entity.first_seen, parse_datetime(&first.to_rfc3339(), "t").unwrap());
        assert_eq!(entity.last_seen, parse_datetime(&later.to_rfc3339(), "t").unwrap());
    }

    #[test]
    fn test_missing_entity() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.find_entity("404").unwrap().is_none());
    }

    #[test]
    fn test_history_point_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let at = Local::now();
        db.upsert_entity(&update("111629384"), at).unwrap();

        assert!(db.insert_history_point("111629384", 88_421_000, Some(12), at).unwrap());
        assert!(!db.insert_history_point("111629384", 88_421_000, Some(12), at).unwrap());
        assert!(db
            .insert_history_point("111629384", 88_500_000, Some(11), at + Duration::seconds(1))
            .unwrap());
        assert_eq!(history_len(&db, "111629384").unwrap(), 2);
    }

    #[test]
    fn test_history_requires_entity() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.insert_history_point("ghost", 1, None, Local::now()).is_err());
    }
}
