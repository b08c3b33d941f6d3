use rusqlite::{Connection, Result};

/// Latest schema version; bumped whenever a migration step is added
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the upload queue schema, applying any missing migrations.
///
/// Existing data is never dropped; each step only creates missing tables,
/// indexes or columns.
pub fn init_queue_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS queue_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT version FROM queue_schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        create_schema_v1(conn)?;
        conn.execute("INSERT INTO queue_schema_version (version) VALUES (1)", [])?;
    }

    if current_version < 2 {
        create_schema_v2(conn)?;
        conn.execute("INSERT INTO queue_schema_version (version) VALUES (2)", [])?;
    }

    if current_version < 3 {
        migrate_to_v3(conn)?;
        conn.execute("INSERT INTO queue_schema_version (version) VALUES (3)", [])?;
    }

    Ok(())
}

/// Version 1: drafts and cached photo payloads
fn create_schema_v1(conn: &Connection) -> Result<()> {
    // Table: drafts (parent records, body is the JSON document without payloads)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS drafts (
            local_id TEXT PRIMARY KEY,
            batch_id TEXT,
            driver_id TEXT,
            status TEXT NOT NULL DEFAULT 'draft' CHECK(status IN ('draft', 'submitted')),
            body TEXT NOT NULL,
            last_saved INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_drafts_batch ON drafts(batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_drafts_driver ON drafts(driver_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_drafts_status ON drafts(status)",
        [],
    )?;

    // Table: photo_blobs (opaque binary payloads, one row per photo)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS photo_blobs (
            blob_id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            line_key TEXT NOT NULL,
            line_index INTEGER NOT NULL,
            photo_index INTEGER NOT NULL,
            data BLOB NOT NULL,
            captured_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_photo_blobs_owner ON photo_blobs(owner)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_photo_blobs_line ON photo_blobs(line_key)",
        [],
    )?;

    Ok(())
}

/// Version 2: photo upload tasks
fn create_schema_v2(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS upload_queue (
            upload_id TEXT PRIMARY KEY,
            batch_local_id TEXT,
            batch_id TEXT,
            parent_doc_id TEXT,
            line_index INTEGER NOT NULL,
            photo_index INTEGER NOT NULL,
            filename TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'uploading', 'completed', 'failed')),
            retries INTEGER NOT NULL DEFAULT 0 CHECK(retries >= 0),
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_retry_at INTEGER,
            completed_at INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_upload_queue_status ON upload_queue(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_upload_queue_local ON upload_queue(batch_local_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_upload_queue_batch ON upload_queue(batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_upload_queue_parent ON upload_queue(parent_doc_id)",
        [],
    )?;

    Ok(())
}

/// Version 3: record upsert tasks and backoff scheduling
fn migrate_to_v3(conn: &Connection) -> Result<()> {
    let has_next_attempt: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_info('upload_queue') WHERE name='next_attempt_at'",
            [],
            |row| row.get::<_, i32>(0).map(|c| c > 0),
        )
        .unwrap_or(false);

    if !has_next_attempt {
        conn.execute(
            "ALTER TABLE upload_queue ADD COLUMN next_attempt_at INTEGER",
            [],
        )?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS record_queue (
            upload_id TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            doc_id TEXT,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'uploading', 'completed', 'failed')),
            retries INTEGER NOT NULL DEFAULT 0 CHECK(retries >= 0),
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            next_attempt_at INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_record_queue_status ON record_queue(status)",
        [],
    )?;

    Ok(())
}
