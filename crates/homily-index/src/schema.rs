//! Relational layout of the sermon corpus.
//!
//! The search engine only reads this schema. [`create_schema`] and
//! [`rebuild_fts`] exist for the tooling that builds a corpus and for tests.

use rusqlite::Connection;

use crate::error::StorageError;

/// Tables and full-text indexes the engine queries.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sermons (
    id INTEGER PRIMARY KEY,
    uid TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    date TEXT
);

CREATE TABLE IF NOT EXISTS sections (
    uid TEXT PRIMARY KEY,
    sermon_uid TEXT NOT NULL REFERENCES sermons(uid),
    number INTEGER,
    order_index INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS paragraphs (
    uid TEXT PRIMARY KEY,
    section_uid TEXT NOT NULL REFERENCES sections(uid),
    order_index INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS blocks (
    uid TEXT NOT NULL UNIQUE,
    paragraph_uid TEXT NOT NULL REFERENCES paragraphs(uid),
    section_uid TEXT NOT NULL,
    sermon_uid TEXT NOT NULL,
    text TEXT NOT NULL,
    order_index INTEGER NOT NULL,
    type TEXT,
    indented INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS paragraphs_text (
    uid TEXT NOT NULL UNIQUE,
    section_uid TEXT NOT NULL,
    sermon_uid TEXT NOT NULL,
    text TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sections_sermon ON sections(sermon_uid, order_index);
CREATE INDEX IF NOT EXISTS idx_paragraphs_section ON paragraphs(section_uid, order_index);
CREATE INDEX IF NOT EXISTS idx_blocks_paragraph ON blocks(paragraph_uid, order_index);
CREATE INDEX IF NOT EXISTS idx_blocks_sermon ON blocks(sermon_uid);

CREATE VIRTUAL TABLE IF NOT EXISTS blocks_fts USING fts5(
    uid UNINDEXED,
    text,
    sermon_uid UNINDEXED,
    content='blocks',
    content_rowid='rowid'
);

CREATE VIRTUAL TABLE IF NOT EXISTS paragraphs_fts USING fts5(
    uid UNINDEXED,
    text,
    section_uid UNINDEXED,
    sermon_uid UNINDEXED,
    content='paragraphs_text',
    content_rowid='rowid',
    tokenize='porter unicode61'
);
"#;

/// Create every table and index in [`SCHEMA`].
pub fn create_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Rebuild both external-content FTS indexes from their source tables.
pub fn rebuild_fts(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "INSERT INTO blocks_fts(blocks_fts) VALUES('rebuild');
         INSERT INTO paragraphs_fts(paragraphs_fts) VALUES('rebuild');",
    )?;
    Ok(())
}
