// ── Mnemo Store: Database Schema ────────────────────────────────────────────
//
// Tables for the two-tier memory substrate.
//
//   - nodes:       long-term memory units (content, hash, embedding, tombstone)
//   - nodes_fts:   FTS5 index over content (BM25 ranking, porter stemming)
//   - tags:        hierarchical topic labels (materialized ancestors)
//   - node_tags:   node ↔ tag many-to-many
//   - robots:      agent identities
//   - robot_nodes: robot ↔ node associations carrying the working-memory flag
//
// All statements are idempotent (CREATE IF NOT EXISTS / ADD COLUMN with
// silent error) so migrations can re-run on every open.

use crate::atoms::error::EngineResult;
use log::info;
use rusqlite::Connection;

/// Run all migrations. Called once per store open, on the first pool
/// connection, before any other connection is handed out.
pub fn run_migrations(conn: &Connection) -> EngineResult<()> {
    info!("[store] Running schema migrations");

    conn.execute_batch(SCHEMA)?;

    // ── Idempotent column additions for future migrations ────────────
    // Pattern: try ADD COLUMN, swallow error if already exists.
    // Add new migrations below as needed.

    // Dimension the provider actually produced, kept separate from the
    // padded vector so re-embedding can detect model drift.
    let _ = conn.execute(
        "ALTER TABLE nodes ADD COLUMN embedding_dimension INTEGER",
        [],
    );

    info!("[store] Schema migrations complete");
    Ok(())
}

const SCHEMA: &str = "
    -- ═══════════════════════════════════════════════════════════════
    -- Nodes (long-term memory)
    -- content_hash is a functional key: identical content dedupes.
    -- deleted_at is the soft-delete tombstone; every default query
    -- path filters on it.
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,

        content TEXT NOT NULL,
        content_hash TEXT NOT NULL UNIQUE,

        -- f32 array serialized as little-endian BLOB, zero-padded to the
        -- configured dimension
        embedding BLOB,
        embedding_dimension INTEGER,

        token_count INTEGER NOT NULL DEFAULT 0,
        metadata TEXT NOT NULL DEFAULT '{}',
        is_proposition INTEGER NOT NULL DEFAULT 0,

        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        deleted_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_nodes_deleted
        ON nodes(deleted_at);
    CREATE INDEX IF NOT EXISTS idx_nodes_created
        ON nodes(created_at);
    CREATE INDEX IF NOT EXISTS idx_nodes_proposition
        ON nodes(is_proposition);

    -- FTS5 index for keyword search (BM25 ranking)
    CREATE VIRTUAL TABLE IF NOT EXISTS nodes_fts USING fts5(
        content,
        content=nodes,
        content_rowid=id,
        tokenize='porter unicode61'
    );

    -- Triggers keep FTS in sync with the main table
    CREATE TRIGGER IF NOT EXISTS nodes_fts_insert AFTER INSERT ON nodes
    BEGIN
        INSERT INTO nodes_fts(rowid, content) VALUES (NEW.id, NEW.content);
    END;

    CREATE TRIGGER IF NOT EXISTS nodes_fts_delete AFTER DELETE ON nodes
    BEGIN
        INSERT INTO nodes_fts(nodes_fts, rowid, content)
        VALUES ('delete', OLD.id, OLD.content);
    END;

    CREATE TRIGGER IF NOT EXISTS nodes_fts_update AFTER UPDATE OF content ON nodes
    BEGIN
        INSERT INTO nodes_fts(nodes_fts, rowid, content)
        VALUES ('delete', OLD.id, OLD.content);
        INSERT INTO nodes_fts(rowid, content) VALUES (NEW.id, NEW.content);
    END;

    -- ═══════════════════════════════════════════════════════════════
    -- Tags (hierarchical ontology)
    -- Every ancestor of a stored tag name has its own row; the tag
    -- engine materializes them on insert.
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS node_tags (
        node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
        UNIQUE(node_id, tag_id)
    );

    CREATE INDEX IF NOT EXISTS idx_node_tags_tag
        ON node_tags(tag_id);
    CREATE INDEX IF NOT EXISTS idx_node_tags_node
        ON node_tags(node_id);

    -- ═══════════════════════════════════════════════════════════════
    -- Robots (agent identities)
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS robots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        last_active_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        metadata TEXT NOT NULL DEFAULT '{}'
    );

    -- ═══════════════════════════════════════════════════════════════
    -- Robot ↔ node associations
    -- working_memory is the canonical working-set membership flag.
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS robot_nodes (
        robot_id INTEGER NOT NULL REFERENCES robots(id) ON DELETE CASCADE,
        node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
        working_memory INTEGER NOT NULL DEFAULT 0,
        access_count INTEGER NOT NULL DEFAULT 0,
        last_accessed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        UNIQUE(robot_id, node_id)
    );

    CREATE INDEX IF NOT EXISTS idx_robot_nodes_wm
        ON robot_nodes(robot_id, working_memory);
    CREATE INDEX IF NOT EXISTS idx_robot_nodes_node
        ON robot_nodes(node_id);
";
