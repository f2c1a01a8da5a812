use anyhow::{Context, Result};
use duckdb::Connection;

pub fn run(conn: &Connection) -> Result<()> {
    // Schema version table; migrations are applied sequentially.
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )
    .context("creating schema_migrations table")?;

    let current = current_version(conn)?;
    let mut migrations_applied = false;

    if current < 1 {
        apply_v1(conn)?;
        set_version(conn, 1)?;
        migrations_applied = true;
    }

    if current < 2 {
        apply_v2(conn)?;
        set_version(conn, 2)?;
        migrations_applied = true;
    }

    // Merge the WAL so ALTER TABLE statements are not replayed on next open.
    if migrations_applied {
        conn.execute_batch("FORCE CHECKPOINT;")
            .context("forcing checkpoint after migrations")?;
    }

    Ok(())
}

fn current_version(conn: &Connection) -> Result<i64> {
    let mut stmt = conn.prepare("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")?;
    let v: i64 = stmt.query_row([], |row| row.get(0))?;
    Ok(v)
}

fn set_version(conn: &Connection, v: i64) -> Result<()> {
    conn.execute("INSERT INTO schema_migrations (version) VALUES (?)", [v])?;
    Ok(())
}

fn apply_v1(conn: &Connection) -> Result<()> {
    // Extracted collections keep their raw payload next to the typed columns
    // so reporting views can reach fields the pipeline does not model.
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            fetched_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            fetched_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            source_type TEXT,
            status TEXT,
            category_tag TEXT,
            assignee TEXT,
            created_at TIMESTAMP,
            updated_at TIMESTAMP,
            closed_at TIMESTAMP,
            priority TEXT,
            ticket_type TEXT,
            submitter TEXT,
            title TEXT,
            summary TEXT,
            sentiment TEXT,
            data TEXT NOT NULL,
            fetched_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        -- No FK to conversations: messages are upserted independently and
        -- DuckDB rejects parent upserts that have dependent rows.
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            sent_at TIMESTAMP NOT NULL,
            sender TEXT,
            text TEXT NOT NULL,
            is_private_note BOOLEAN NOT NULL DEFAULT FALSE,
            data TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversation_classifications (
            conversation_id TEXT PRIMARY KEY,
            category TEXT,
            sub_category TEXT,
            reasoning TEXT,
            resolution TEXT,
            provenance TEXT NOT NULL DEFAULT 'none',
            created_at TIMESTAMP NOT NULL,
            updated_time TIMESTAMP
        );
        "#,
    )
    .context("applying v1 schema")?;

    Ok(())
}

fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        ALTER TABLE conversation_classifications ADD COLUMN is_excluded BOOLEAN DEFAULT FALSE;
        ALTER TABLE conversation_classifications ADD COLUMN exclusion_reason TEXT;
        UPDATE conversation_classifications SET is_excluded = COALESCE(is_excluded, FALSE);
        "#,
    )
    .context("applying v2 schema (exclusion marker)")
}
