//! Persistent catalog (C11): the `mce_calc_object_info` table backing the
//! registry, via `rusqlite`. Lives on the VM actor thread like everything
//! else in this crate, so a `RefCell` is enough for interior mutability.

use std::cell::RefCell;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, EngineResult};
use crate::types::ArtifactDef;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS mce_calc_object_info (
    object_id         TEXT PRIMARY KEY,
    object_name       TEXT,
    custom_tag        TEXT,
    parent_id         TEXT,
    python_code       TEXT NOT NULL DEFAULT '',
    python_expr       TEXT NOT NULL DEFAULT '',
    lru_maxsize       INTEGER NOT NULL DEFAULT 0,
    ttl_seconds       INTEGER NOT NULL DEFAULT 0,
    remark            TEXT,
    sort_number       INTEGER NOT NULL DEFAULT 0,
    last_updated_time TEXT
);
";

/// Optional filters for `query` (§4.7 `query` operation).
#[derive(Clone, Debug, Default)]
pub struct QueryFilter {
    pub object_id: Option<String>,
    pub custom_tag: Option<String>,
    pub parent_id: Option<String>,
}

pub struct Store {
    conn: RefCell<Connection>,
}

impl Store {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self { conn: RefCell::new(conn) };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: RefCell::new(conn) };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> EngineResult<()> {
        self.conn.borrow().execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn load_all(&self) -> EngineResult<Vec<ArtifactDef>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare("SELECT * FROM mce_calc_object_info ORDER BY sort_number, object_id")?;
        let rows = stmt.query_map([], row_to_def)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
    }

    pub fn get_by_id(&self, object_id: &str) -> EngineResult<Option<ArtifactDef>> {
        let conn = self.conn.borrow();
        conn.query_row("SELECT * FROM mce_calc_object_info WHERE object_id = ?1", params![object_id], row_to_def)
            .optional()
            .map_err(EngineError::from)
    }

    pub fn query(&self, filter: &QueryFilter) -> EngineResult<Vec<ArtifactDef>> {
        let all = self.load_all()?;
        Ok(all
            .into_iter()
            .filter(|d| filter.object_id.is_none() || filter.object_id.as_deref() == Some(d.object_id.as_str()))
            .filter(|d| filter.custom_tag.is_none() || d.custom_tag.as_deref() == filter.custom_tag.as_deref())
            .filter(|d| filter.parent_id.is_none() || d.parent_id.as_deref() == filter.parent_id.as_deref())
            .collect())
    }

    /// Inserts a new artifact, stamping `last_updated_time`. Fails with
    /// `BadArgument` if `object_id` already exists.
    pub fn insert(&self, mut def: ArtifactDef) -> EngineResult<ArtifactDef> {
        if self.get_by_id(&def.object_id)?.is_some() {
            return Err(EngineError::BadArgument(format!("artifact already exists: {}", def.object_id)));
        }
        def.last_updated_time = Some(Utc::now());
        self.conn.borrow().execute(
            "INSERT INTO mce_calc_object_info
                (object_id, object_name, custom_tag, parent_id, python_code, python_expr,
                 lru_maxsize, ttl_seconds, remark, sort_number, last_updated_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                def.object_id,
                def.object_name,
                def.custom_tag,
                def.parent_id,
                def.python_code,
                def.python_expr,
                def.lru_maxsize,
                def.ttl_seconds,
                def.remark,
                def.sort_number,
                def.last_updated_time.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(def)
    }

    /// Updates an existing artifact in place, re-stamping `last_updated_time`.
    pub fn update_by_id(&self, object_id: &str, mut def: ArtifactDef) -> EngineResult<ArtifactDef> {
        if self.get_by_id(object_id)?.is_none() {
            return Err(EngineError::NotFound {
                object_id: object_id.to_string(),
            });
        }
        def.object_id = object_id.to_string();
        def.last_updated_time = Some(Utc::now());
        self.conn.borrow().execute(
            "UPDATE mce_calc_object_info SET
                object_name = ?2, custom_tag = ?3, parent_id = ?4, python_code = ?5,
                python_expr = ?6, lru_maxsize = ?7, ttl_seconds = ?8, remark = ?9,
                sort_number = ?10, last_updated_time = ?11
             WHERE object_id = ?1",
            params![
                def.object_id,
                def.object_name,
                def.custom_tag,
                def.parent_id,
                def.python_code,
                def.python_expr,
                def.lru_maxsize,
                def.ttl_seconds,
                def.remark,
                def.sort_number,
                def.last_updated_time.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(def)
    }

    pub fn delete_by_id(&self, object_id: &str) -> EngineResult<()> {
        let affected = self.conn.borrow().execute("DELETE FROM mce_calc_object_info WHERE object_id = ?1", params![object_id])?;
        if affected == 0 {
            return Err(EngineError::NotFound {
                object_id: object_id.to_string(),
            });
        }
        Ok(())
    }
}

fn row_to_def(row: &rusqlite::Row) -> rusqlite::Result<ArtifactDef> {
    let last_updated_time: Option<String> = row.get("last_updated_time")?;
    Ok(ArtifactDef {
        object_id: row.get("object_id")?,
        object_name: row.get("object_name")?,
        custom_tag: row.get("custom_tag")?,
        parent_id: row.get("parent_id")?,
        python_code: row.get("python_code")?,
        python_expr: row.get("python_expr")?,
        lru_maxsize: row.get("lru_maxsize")?,
        ttl_seconds: row.get("ttl_seconds")?,
        remark: row.get("remark")?,
        sort_number: row.get("sort_number")?,
        last_updated_time: last_updated_time.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok()).map(|t| t.with_timezone(&Utc)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> ArtifactDef {
        ArtifactDef {
            object_id: id.to_string(),
            python_expr: "1 + 1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let store = Store::open_in_memory().unwrap();
        store.insert(sample("a")).unwrap();
        let fetched = store.get_by_id("a").unwrap().unwrap();
        assert_eq!(fetched.object_id, "a");
        assert!(fetched.last_updated_time.is_some());
    }

    #[test]
    fn insert_duplicate_fails() {
        let store = Store::open_in_memory().unwrap();
        store.insert(sample("a")).unwrap();
        assert!(store.insert(sample("a")).is_err());
    }

    #[test]
    fn update_missing_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.update_by_id("missing", sample("missing")).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[test]
    fn delete_removes_row() {
        let store = Store::open_in_memory().unwrap();
        store.insert(sample("a")).unwrap();
        store.delete_by_id("a").unwrap();
        assert!(store.get_by_id("a").unwrap().is_none());
    }

    #[test]
    fn query_filters_by_custom_tag() {
        let store = Store::open_in_memory().unwrap();
        let mut tagged = sample("a");
        tagged.custom_tag = Some("x".to_string());
        store.insert(tagged).unwrap();
        store.insert(sample("b")).unwrap();

        let filter = QueryFilter {
            custom_tag: Some("x".to_string()),
            ..Default::default()
        };
        let results = store.query(&filter).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].object_id, "a");
    }
}
