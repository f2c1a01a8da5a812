pub mod migrations;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::{params, Connection};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::types::{
    Classification, ClassificationRecord, Conversation, EntityKind, LifecycleState, Message,
    Provenance,
};

const CLASSIFICATION_COLUMNS: &str = "conversation_id, category, sub_category, reasoning, resolution, provenance, CAST(created_at AS TEXT), CAST(updated_time AS TEXT), COALESCE(is_excluded, FALSE)";

/// What `record_classification` did with a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Row inserted or replaced; it is now pending sync.
    Applied,
    /// Same provenance and same values as the stored row; nothing written.
    Unchanged,
    /// An existing row of higher priority was kept.
    Superseded { existing: Provenance },
}

/// Local DuckDB store shared by every pipeline component.
///
/// All writes go through one connection guarded by a mutex, so each upsert is
/// atomic at row granularity and concurrent writers to the same id resolve
/// last-write-wins.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
    /// Create or open the database at the provided path and run migrations.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = expand_tilde(db_path.as_ref())?;
        if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).context("creating DB directory")?;
        }
        let conn = Connection::open(&db_path).context("opening DuckDB")?;
        migrations::run(&conn).context("running migrations")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Non-persistent store, mostly for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory DuckDB")?;
        migrations::run(&conn).context("running migrations")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Checkpoint the database so the WAL is merged into the main file.
    /// Call this before shutdown.
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch("CHECKPOINT;")
            .context("checkpointing database")
    }

    /// Exclusive access to the underlying connection.
    pub fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection mutex poisoned"))
    }

    // ---------- Extracted entities ----------

    /// Overwrite-or-insert a raw user/customer payload.
    pub fn upsert_raw(&self, kind: EntityKind, id: &str, payload: &JsonValue) -> Result<()> {
        let table = match kind {
            EntityKind::Users => "users",
            EntityKind::Customers => "customers",
            other => bail!("{} rows must be stored through their typed upsert", other.as_str()),
        };
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {table} (id, data, fetched_at) VALUES (?, ?, CURRENT_TIMESTAMP)"
            ),
            params![id, payload.to_string()],
        )
        .with_context(|| format!("upserting {} {}", kind.as_str(), id))?;
        Ok(())
    }

    pub fn upsert_conversation(&self, conversation: &Conversation, payload: &JsonValue) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT OR REPLACE INTO conversations
                (id, source_type, status, category_tag, assignee, created_at, updated_at, closed_at,
                 priority, ticket_type, submitter, title, summary, sentiment, data, fetched_at)
               VALUES (?, ?, ?, ?, ?, CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP),
                       ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)"#,
            params![
                conversation.id,
                conversation.source_type,
                conversation.status,
                conversation.category_tag,
                conversation.assignee,
                conversation.created_at.as_ref().map(ts_param),
                conversation.updated_at.as_ref().map(ts_param),
                conversation.closed_at.as_ref().map(ts_param),
                conversation.priority,
                conversation.ticket_type,
                conversation.submitter,
                conversation.title,
                conversation.summary,
                conversation.sentiment,
                payload.to_string(),
            ],
        )
        .with_context(|| format!("upserting conversation {}", conversation.id))?;
        Ok(())
    }

    pub fn upsert_message(&self, message: &Message, payload: &JsonValue) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT OR REPLACE INTO messages
                (id, conversation_id, sent_at, sender, text, is_private_note, data)
               VALUES (?, ?, CAST(? AS TIMESTAMP), ?, ?, ?, ?)"#,
            params![
                message.id,
                message.conversation_id,
                ts_param(&message.sent_at),
                message.sender,
                message.text,
                message.is_private_note,
                payload.to_string(),
            ],
        )
        .with_context(|| format!("upserting message {}", message.id))?;
        Ok(())
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, source_type, status, category_tag, assignee,
                      CAST(created_at AS TEXT), CAST(updated_at AS TEXT), CAST(closed_at AS TEXT),
                      priority, ticket_type, submitter, title, summary, sentiment
               FROM conversations WHERE id = ?"#,
        )?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            let created_at: Option<String> = row.get(5)?;
            let updated_at: Option<String> = row.get(6)?;
            let closed_at: Option<String> = row.get(7)?;
            Ok(Some(Conversation {
                id: row.get(0)?,
                source_type: row.get(1)?,
                status: row.get(2)?,
                category_tag: row.get(3)?,
                assignee: row.get(4)?,
                created_at: created_at.as_deref().map(parse_ts).transpose()?,
                updated_at: updated_at.as_deref().map(parse_ts).transpose()?,
                closed_at: closed_at.as_deref().map(parse_ts).transpose()?,
                priority: row.get(8)?,
                ticket_type: row.get(9)?,
                submitter: row.get(10)?,
                title: row.get(11)?,
                summary: row.get(12)?,
                sentiment: row.get(13)?,
            }))
        } else {
            Ok(None)
        }
    }

    /// Messages of one conversation ordered by send time, ties by id.
    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, CAST(sent_at AS TEXT), sender, text, is_private_note FROM messages WHERE conversation_id = ? ORDER BY sent_at, id",
        )?;
        let mut rows = stmt.query(params![conversation_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let sent_at: String = row.get(2)?;
            out.push(Message {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                sent_at: parse_ts(&sent_at)?,
                sender: row.get(3)?,
                text: row.get(4)?,
                is_private_note: row.get(5)?,
            });
        }
        Ok(out)
    }

    /// Row count of one of the store's tables.
    pub fn count(&self, kind: EntityKind) -> Result<i64> {
        let conn = self.conn()?;
        let sql = format!("SELECT COUNT(*) FROM {}", kind.as_str());
        let mut stmt = conn.prepare(&sql)?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(count)
    }

    // ---------- Classifications ----------

    /// Store a classification, honouring provenance priority.
    pub fn record_classification(
        &self,
        conversation_id: &str,
        classification: &Classification,
        provenance: Provenance,
    ) -> Result<RecordOutcome> {
        self.record_classification_at(conversation_id, classification, provenance, Utc::now())
    }

    /// Same as [`record_classification`](Self::record_classification) with an explicit clock.
    ///
    /// A write is applied only when its provenance ranks at least as high as
    /// the stored one. Equal-rank writes replace the row when any of
    /// category, sub-category or resolution differs, and are no-ops otherwise.
    /// On apply `created_at` is set to `now` and `updated_time` is cleared.
    pub fn record_classification_at(
        &self,
        conversation_id: &str,
        classification: &Classification,
        provenance: Provenance,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("starting classification write")?;

        let existing = {
            let sql = format!(
                "SELECT {CLASSIFICATION_COLUMNS} FROM conversation_classifications WHERE conversation_id = ?"
            );
            let mut stmt = tx.prepare(&sql)?;
            let mut rows = stmt.query(params![conversation_id])?;
            match rows.next()? {
                Some(row) => Some(read_classification(row)?),
                None => None,
            }
        };

        if let Some(existing) = &existing {
            if existing.provenance > provenance {
                return Ok(RecordOutcome::Superseded {
                    existing: existing.provenance,
                });
            }
            if existing.provenance == provenance
                && existing.category == classification.category
                && existing.sub_category == classification.sub_category
                && existing.resolution == classification.resolution
            {
                return Ok(RecordOutcome::Unchanged);
            }
        }

        let (excluded, reason) = match &existing {
            Some(record) if record.excluded => (true, exclusion_reason(&tx, conversation_id)?),
            _ => (false, None),
        };

        tx.execute(
            r#"INSERT OR REPLACE INTO conversation_classifications
                (conversation_id, category, sub_category, reasoning, resolution, provenance,
                 created_at, updated_time, is_excluded, exclusion_reason)
               VALUES (?, ?, ?, ?, ?, ?, CAST(? AS TIMESTAMP), NULL, ?, ?)"#,
            params![
                conversation_id,
                classification.category,
                classification.sub_category,
                classification.reasoning,
                classification.resolution,
                provenance.as_str(),
                ts_param(&now),
                excluded,
                reason,
            ],
        )
        .with_context(|| format!("recording classification for {}", conversation_id))?;
        tx.commit().context("committing classification write")?;
        Ok(RecordOutcome::Applied)
    }

    pub fn get_classification(&self, conversation_id: &str) -> Result<Option<ClassificationRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {CLASSIFICATION_COLUMNS} FROM conversation_classifications WHERE conversation_id = ?"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![conversation_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_classification(row)?)),
            None => Ok(None),
        }
    }

    /// Records resolved locally but not yet confirmed on the remote side:
    /// category and resolution set, not excluded, and never synced or synced
    /// before the current classification was written.
    pub fn pending_classifications(&self) -> Result<Vec<ClassificationRecord>> {
        let sql = format!(
            r#"SELECT {CLASSIFICATION_COLUMNS} FROM conversation_classifications
               WHERE category IS NOT NULL
                 AND resolution IS NOT NULL
                 AND NOT COALESCE(is_excluded, FALSE)
                 AND (updated_time IS NULL OR updated_time < created_at)
               ORDER BY created_at, conversation_id"#
        );
        self.query_classifications(&sql, [])
    }

    /// Classified, non-excluded records ordered by id, for out-of-band passes.
    pub fn categorized_classifications(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ClassificationRecord>> {
        let sql = format!(
            r#"SELECT {CLASSIFICATION_COLUMNS} FROM conversation_classifications
               WHERE category IS NOT NULL AND NOT COALESCE(is_excluded, FALSE)
               ORDER BY conversation_id
               LIMIT ? OFFSET ?"#
        );
        self.query_classifications(&sql, params![limit as i64, offset as i64])
    }

    /// Set `updated_time` after a confirmed remote write. Returns whether a row changed.
    pub fn mark_synced(&self, conversation_id: &str, timestamp: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE conversation_classifications SET updated_time = CAST(? AS TIMESTAMP) WHERE conversation_id = ?",
                params![ts_param(&timestamp), conversation_id],
            )
            .with_context(|| format!("marking {} synced", conversation_id))?;
        Ok(changed > 0)
    }

    /// Operator-forced re-check: the record re-enters the pending set.
    pub fn reset_sync(&self, conversation_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE conversation_classifications SET updated_time = NULL WHERE conversation_id = ?",
            params![conversation_id],
        )?;
        Ok(changed > 0)
    }

    /// Mark an id as excluded from automatic processing. History is kept.
    pub fn exclude(&self, conversation_id: &str, reason: Option<&str>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE conversation_classifications SET is_excluded = TRUE, exclusion_reason = ? WHERE conversation_id = ?",
            params![reason, conversation_id],
        )?;
        if updated == 0 {
            tx.execute(
                r#"INSERT INTO conversation_classifications
                    (conversation_id, provenance, created_at, is_excluded, exclusion_reason)
                   VALUES (?, 'none', CAST(? AS TIMESTAMP), TRUE, ?)"#,
                params![conversation_id, ts_param(&Utc::now()), reason],
            )?;
        }
        tx.commit()
            .with_context(|| format!("excluding {}", conversation_id))?;
        Ok(())
    }

    pub fn excluded_ids(&self) -> Result<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT conversation_id FROM conversation_classifications WHERE COALESCE(is_excluded, FALSE)",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = HashSet::new();
        while let Some(row) = rows.next()? {
            out.insert(row.get::<_, String>(0)?);
        }
        Ok(out)
    }

    /// Stored conversations with no classification, an unresolved one, or one
    /// still missing its resolution, newest first.
    pub fn unclassified_conversation_ids(&self, limit: Option<usize>) -> Result<Vec<String>> {
        let mut sql = String::from(
            r#"SELECT c.id FROM conversations c
               LEFT JOIN conversation_classifications k ON k.conversation_id = c.id
               WHERE k.conversation_id IS NULL
                  OR ((k.provenance = 'none' OR k.resolution IS NULL)
                      AND NOT COALESCE(k.is_excluded, FALSE))
               ORDER BY c.created_at DESC NULLS LAST, c.id"#,
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        self.query_ids(&sql)
    }

    /// Every stored, non-excluded conversation id.
    pub fn active_conversation_ids(&self, limit: Option<usize>) -> Result<Vec<String>> {
        let mut sql = String::from(
            r#"SELECT c.id FROM conversations c
               LEFT JOIN conversation_classifications k ON k.conversation_id = c.id
               WHERE NOT COALESCE(k.is_excluded, FALSE)
               ORDER BY c.created_at DESC NULLS LAST, c.id"#,
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        self.query_ids(&sql)
    }

    /// Counts per lifecycle state, including conversations never classified.
    pub fn lifecycle_counts(&self) -> Result<BTreeMap<LifecycleState, usize>> {
        let mut counts = BTreeMap::new();
        let sql = format!("SELECT {CLASSIFICATION_COLUMNS} FROM conversation_classifications");
        for record in self.query_classifications(&sql, [])? {
            *counts.entry(record.lifecycle()).or_insert(0) += 1;
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT COUNT(*) FROM conversations c
               WHERE NOT EXISTS (SELECT 1 FROM conversation_classifications k WHERE k.conversation_id = c.id)"#,
        )?;
        let unclassified: i64 = stmt.query_row([], |row| row.get(0))?;
        if unclassified > 0 {
            counts.insert(LifecycleState::Unclassified, unclassified as usize);
        }
        Ok(counts)
    }

    pub fn provenance_counts(&self) -> Result<BTreeMap<Provenance, usize>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT provenance, COUNT(*) FROM conversation_classifications GROUP BY provenance",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let provenance: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            *out.entry(Provenance::from_str(&provenance)).or_insert(0) += count as usize;
        }
        Ok(out)
    }

    fn query_classifications<P: duckdb::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<ClassificationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_classification(row)?);
        }
        Ok(out)
    }

    fn query_ids(&self, sql: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get::<_, String>(0)?);
        }
        Ok(out)
    }
}

fn read_classification(row: &duckdb::Row<'_>) -> Result<ClassificationRecord> {
    let provenance: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_time: Option<String> = row.get(7)?;
    Ok(ClassificationRecord {
        conversation_id: row.get(0)?,
        category: row.get(1)?,
        sub_category: row.get(2)?,
        reasoning: row.get(3)?,
        resolution: row.get(4)?,
        provenance: Provenance::from_str(&provenance),
        created_at: parse_ts(&created_at)?,
        updated_time: updated_time.as_deref().map(parse_ts).transpose()?,
        excluded: row.get(8)?,
    })
}

fn exclusion_reason(conn: &Connection, conversation_id: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT exclusion_reason FROM conversation_classifications WHERE conversation_id = ?",
    )?;
    let reason: Option<String> = stmt.query_row(params![conversation_id], |row| row.get(0))?;
    Ok(reason)
}

/// DuckDB TIMESTAMP columns are naive; everything stored is UTC.
fn ts_param(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S%.f")
        .with_context(|| format!("parsing stored timestamp {:?}", s))?;
    Ok(naive.and_utc())
}

fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if path_str == "~" {
        let base = directories::BaseDirs::new().context("resolving home directory")?;
        Ok(base.home_dir().to_path_buf())
    } else if let Some(stripped) = path_str.strip_prefix("~/") {
        let base = directories::BaseDirs::new().context("resolving home directory")?;
        Ok(base.home_dir().join(stripped))
    } else {
        Ok(path.to_path_buf())
    }
}
