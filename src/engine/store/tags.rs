// ── Mnemo Store: Tag Rows ───────────────────────────────────────────────────
//
// Low-level tag and node_tags persistence. Hierarchy semantics (ancestor
// materialization, validation) live in engine/tags.rs — this layer only
// knows names and ids.

use super::MemoryStore;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::Tag;
use rusqlite::{params, OptionalExtension};

impl MemoryStore {
    /// Insert a tag name if missing; return its row either way.
    pub fn find_or_create_tag(&self, name: &str) -> EngineResult<Tag> {
        let conn = self.conn();
        conn.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", params![name])?;
        let tag = conn.query_row(
            "SELECT id, name FROM tags WHERE name = ?1",
            params![name],
            |r| Ok(Tag { id: r.get(0)?, name: r.get(1)? }),
        )?;
        Ok(tag)
    }

    /// Look up a tag by exact name.
    pub fn tag_by_name(&self, name: &str) -> EngineResult<Option<Tag>> {
        let conn = self.conn();
        let tag = conn
            .query_row(
                "SELECT id, name FROM tags WHERE name = ?1",
                params![name],
                |r| Ok(Tag { id: r.get(0)?, name: r.get(1)? }),
            )
            .optional()?;
        Ok(tag)
    }

    /// Every tag name, sorted. The fuzzy searcher scores against this set.
    pub fn all_tag_names(&self) -> EngineResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name FROM tags ORDER BY name")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Random sample of tag names, used as ontology context for the tag
    /// provider.
    pub fn sample_tag_names(&self, limit: usize) -> EngineResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT name FROM tags ORDER BY RANDOM() LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Tag names starting with `prefix` (raw LIKE; the tag engine applies
    /// `:` boundary semantics on top).
    pub fn tag_names_like(&self, prefix: &str) -> EngineResult<Vec<String>> {
        let conn = self.conn();
        // Escape LIKE wildcards in the prefix itself.
        let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let mut stmt = conn.prepare(
            "SELECT name FROM tags WHERE name LIKE ?1 ESCAPE '\\' ORDER BY name",
        )?;
        let rows = stmt.query_map(params![format!("{escaped}%")], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Associate a tag with a node. Idempotent.
    pub fn associate_tag(&self, node_id: i64, tag_id: i64) -> EngineResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO node_tags (node_id, tag_id) VALUES (?1, ?2)",
            params![node_id, tag_id],
        )?;
        Ok(())
    }

    /// Remove one node ↔ tag association (the tag row itself stays).
    pub fn dissociate_tag(&self, node_id: i64, tag_id: i64) -> EngineResult<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "DELETE FROM node_tags WHERE node_id = ?1 AND tag_id = ?2",
            params![node_id, tag_id],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found("node_tag", format!("{node_id}:{tag_id}")));
        }
        Ok(())
    }

    /// Tag names associated with a node, sorted.
    pub fn tags_for_node(&self, node_id: i64) -> EngineResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.name FROM node_tags nt
             JOIN tags t ON t.id = nt.tag_id
             WHERE nt.node_id = ?1
             ORDER BY t.name",
        )?;
        let rows = stmt.query_map(params![node_id], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_find_or_create_is_idempotent() {
        let s = store();
        let a = s.find_or_create_tag("devops").unwrap();
        let b = s.find_or_create_tag("devops").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(s.all_tag_names().unwrap(), vec!["devops"]);
    }

    #[test]
    fn test_associate_and_list() {
        let s = store();
        let node = s.save_node("tagged", 1, &HashMap::new(), false).unwrap();
        let t1 = s.find_or_create_tag("devops").unwrap();
        let t2 = s.find_or_create_tag("devops:kubernetes").unwrap();
        s.associate_tag(node.node_id, t2.id).unwrap();
        s.associate_tag(node.node_id, t1.id).unwrap();
        // Re-associating is a no-op.
        s.associate_tag(node.node_id, t1.id).unwrap();

        assert_eq!(
            s.tags_for_node(node.node_id).unwrap(),
            vec!["devops", "devops:kubernetes"]
        );
    }

    #[test]
    fn test_dissociate() {
        let s = store();
        let node = s.save_node("untag me", 1, &HashMap::new(), false).unwrap();
        let t = s.find_or_create_tag("temp").unwrap();
        s.associate_tag(node.node_id, t.id).unwrap();
        s.dissociate_tag(node.node_id, t.id).unwrap();
        assert!(s.tags_for_node(node.node_id).unwrap().is_empty());
        assert!(s.dissociate_tag(node.node_id, t.id).is_err());
    }

    #[test]
    fn test_like_prefix_escapes_wildcards() {
        let s = store();
        s.find_or_create_tag("rust").unwrap();
        s.find_or_create_tag("rust:async").unwrap();
        s.find_or_create_tag("ruby").unwrap();

        let hits = s.tag_names_like("rust").unwrap();
        assert_eq!(hits, vec!["rust", "rust:async"]);
        // A literal % in the probe must not act as a wildcard.
        assert!(s.tag_names_like("%").unwrap().is_empty());
    }

    #[test]
    fn test_sample_bounded() {
        let s = store();
        for i in 0..10 {
            s.find_or_create_tag(&format!("tag-{i}")).unwrap();
        }
        assert_eq!(s.sample_tag_names(5).unwrap().len(), 5);
        assert_eq!(s.sample_tag_names(50).unwrap().len(), 10);
    }
}
