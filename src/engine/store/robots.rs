// ── Mnemo Store: Robots & Associations ──────────────────────────────────────
//
// Robot identity rows plus robot_nodes, the canonical working-set membership
// table. Working-memory state in process (engine/working_memory.rs) mirrors
// these rows; the flag here is what group sync and recovery read.

use super::{now_str, parse_ts, MemoryStore};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{Node, NodeAssociation, Robot};
use rusqlite::{params, OptionalExtension, Row};

fn robot_from_row(row: &Row<'_>) -> rusqlite::Result<Robot> {
    let metadata_json: String = row.get(4)?;
    Ok(Robot {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_ts(&row.get::<_, String>(2)?),
        last_active_at: parse_ts(&row.get::<_, String>(3)?),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
    })
}

fn association_from_row(row: &Row<'_>) -> rusqlite::Result<NodeAssociation> {
    Ok(NodeAssociation {
        robot_id: row.get(0)?,
        node_id: row.get(1)?,
        working_memory: row.get::<_, i64>(2)? != 0,
        access_count: row.get::<_, i64>(3)? as u32,
        last_accessed_at: parse_ts(&row.get::<_, String>(4)?),
    })
}

impl MemoryStore {
    /// Fetch a robot by name, creating it on first sight.
    pub fn find_or_create_robot(&self, name: &str) -> EngineResult<Robot> {
        let conn = self.conn();
        conn.execute("INSERT OR IGNORE INTO robots (name) VALUES (?1)", params![name])?;
        let robot = conn.query_row(
            "SELECT id, name, created_at, last_active_at, metadata FROM robots WHERE name = ?1",
            params![name],
            robot_from_row,
        )?;
        Ok(robot)
    }

    pub fn get_robot(&self, id: i64) -> EngineResult<Option<Robot>> {
        let conn = self.conn();
        let robot = conn
            .query_row(
                "SELECT id, name, created_at, last_active_at, metadata FROM robots WHERE id = ?1",
                params![id],
                robot_from_row,
            )
            .optional()?;
        Ok(robot)
    }

    /// Bump `last_active_at` to now.
    pub fn touch_robot(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE robots SET last_active_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )?;
        Ok(())
    }

    /// Ensure a robot ↔ node association exists. Idempotent; existing rows
    /// keep their counters.
    pub fn associate_node(&self, robot_id: i64, node_id: i64) -> EngineResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO robot_nodes (robot_id, node_id, last_accessed_at)
             VALUES (?1, ?2, ?3)",
            params![robot_id, node_id, now_str()],
        )?;
        Ok(())
    }

    /// Set the working-memory flag on an association, creating it if needed.
    /// Idempotent — group sync calls this repeatedly.
    pub fn set_working_memory(
        &self,
        robot_id: i64,
        node_id: i64,
        member: bool,
    ) -> EngineResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO robot_nodes (robot_id, node_id, working_memory, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(robot_id, node_id)
             DO UPDATE SET working_memory = excluded.working_memory",
            params![robot_id, node_id, member as i64, now_str()],
        )?;
        Ok(())
    }

    /// Bump the access counter and recency for a robot's association.
    /// Feeds the LFU half of the eviction score.
    pub fn record_access(&self, robot_id: i64, node_id: i64) -> EngineResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO robot_nodes (robot_id, node_id, access_count, last_accessed_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(robot_id, node_id)
             DO UPDATE SET access_count = access_count + 1, last_accessed_at = excluded.last_accessed_at",
            params![robot_id, node_id, now_str()],
        )?;
        Ok(())
    }

    /// The association row for one (robot, node) pair.
    pub fn get_association(
        &self,
        robot_id: i64,
        node_id: i64,
    ) -> EngineResult<Option<NodeAssociation>> {
        let conn = self.conn();
        let assoc = conn
            .query_row(
                "SELECT robot_id, node_id, working_memory, access_count, last_accessed_at
                 FROM robot_nodes WHERE robot_id = ?1 AND node_id = ?2",
                params![robot_id, node_id],
                association_from_row,
            )
            .optional()?;
        Ok(assoc)
    }

    /// Current working set: every live node this robot holds with
    /// `working_memory = true`, paired with its association counters.
    pub fn working_set(&self, robot_id: i64) -> EngineResult<Vec<(Node, NodeAssociation)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT n.id, n.content, n.content_hash, n.embedding, n.embedding_dimension,
                    n.token_count, n.metadata, n.is_proposition, n.created_at, n.updated_at,
                    n.deleted_at,
                    rn.robot_id, rn.node_id, rn.working_memory, rn.access_count, rn.last_accessed_at
             FROM robot_nodes rn
             JOIN nodes n ON n.id = rn.node_id
             WHERE rn.robot_id = ?1 AND rn.working_memory = 1 AND n.deleted_at IS NULL
             ORDER BY rn.last_accessed_at DESC",
        )?;
        let rows = stmt.query_map(params![robot_id], |row| {
            let node = super::nodes::node_from_row(row)?;
            Ok((
                node,
                NodeAssociation {
                    robot_id: row.get(11)?,
                    node_id: row.get(12)?,
                    working_memory: row.get::<_, i64>(13)? != 0,
                    access_count: row.get::<_, i64>(14)? as u32,
                    last_accessed_at: parse_ts(&row.get::<_, String>(15)?),
                },
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Working-set node ids only (the cheap form group sync compares).
    pub fn working_set_ids(&self, robot_id: i64) -> EngineResult<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT rn.node_id FROM robot_nodes rn
             JOIN nodes n ON n.id = rn.node_id
             WHERE rn.robot_id = ?1 AND rn.working_memory = 1 AND n.deleted_at IS NULL
             ORDER BY rn.node_id",
        )?;
        let rows = stmt.query_map(params![robot_id], |r| r.get::<_, i64>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Drop every working-memory flag for a robot. Returns how many were set.
    pub fn clear_working_memory(&self, robot_id: i64) -> EngineResult<usize> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE robot_nodes SET working_memory = 0 WHERE robot_id = ?1 AND working_memory = 1",
            params![robot_id],
        )?;
        Ok(changed)
    }

    /// Node ids associated with any of the given robots (live nodes only).
    /// Used to scope group recall to member-held memories.
    pub fn node_ids_for_robots(&self, robot_ids: &[i64]) -> EngineResult<Vec<i64>> {
        if robot_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let placeholders = vec!["?"; robot_ids.len()].join(",");
        let sql = format!(
            "SELECT DISTINCT rn.node_id FROM robot_nodes rn
             JOIN nodes n ON n.id = rn.node_id
             WHERE rn.robot_id IN ({placeholders}) AND n.deleted_at IS NULL
             ORDER BY rn.node_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(robot_ids.iter()), |r| {
            r.get::<_, i64>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Sum of token_count over a robot's working set.
    pub fn working_set_tokens(&self, robot_id: i64) -> EngineResult<usize> {
        let conn = self.conn();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(n.token_count), 0) FROM robot_nodes rn
             JOIN nodes n ON n.id = rn.node_id
             WHERE rn.robot_id = ?1 AND rn.working_memory = 1 AND n.deleted_at IS NULL",
            params![robot_id],
            |r| r.get(0),
        )?;
        Ok(total as usize)
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
    fn test_find_or_create_robot() {
        let s = store();
        let a = s.find_or_create_robot("athena").unwrap();
        let b = s.find_or_create_robot("athena").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, "athena");
    }

    #[test]
    fn test_working_memory_flag_roundtrip() {
        let s = store();
        let robot = s.find_or_create_robot("athena").unwrap();
        let node = s.save_node("hold me", 3, &HashMap::new(), false).unwrap();

        s.set_working_memory(robot.id, node.node_id, true).unwrap();
        assert_eq!(s.working_set_ids(robot.id).unwrap(), vec![node.node_id]);
        assert_eq!(s.working_set_tokens(robot.id).unwrap(), 3);

        s.set_working_memory(robot.id, node.node_id, false).unwrap();
        assert!(s.working_set_ids(robot.id).unwrap().is_empty());
    }

    #[test]
    fn test_record_access_increments() {
        let s = store();
        let robot = s.find_or_create_robot("athena").unwrap();
        let node = s.save_node("count me", 2, &HashMap::new(), false).unwrap();

        s.record_access(robot.id, node.node_id).unwrap();
        s.record_access(robot.id, node.node_id).unwrap();
        let assoc = s.get_association(robot.id, node.node_id).unwrap().unwrap();
        assert_eq!(assoc.access_count, 2);
    }

    #[test]
    fn test_soft_deleted_nodes_leave_working_set_views() {
        let s = store();
        let robot = s.find_or_create_robot("athena").unwrap();
        let node = s.save_node("will vanish", 2, &HashMap::new(), false).unwrap();
        s.set_working_memory(robot.id, node.node_id, true).unwrap();

        s.soft_delete_node(node.node_id).unwrap();
        assert!(s.working_set_ids(robot.id).unwrap().is_empty());
        assert_eq!(s.working_set_tokens(robot.id).unwrap(), 0);
    }

    #[test]
    fn test_node_ids_for_robots_dedupes() {
        let s = store();
        let a = s.find_or_create_robot("a").unwrap();
        let b = s.find_or_create_robot("b").unwrap();
        let node = s.save_node("shared", 1, &HashMap::new(), false).unwrap();
        s.associate_node(a.id, node.node_id).unwrap();
        s.associate_node(b.id, node.node_id).unwrap();

        assert_eq!(s.node_ids_for_robots(&[a.id, b.id]).unwrap(), vec![node.node_id]);
    }

    #[test]
    fn test_clear_working_memory() {
        let s = store();
        let robot = s.find_or_create_robot("athena").unwrap();
        for text in ["one", "two", "three"] {
            let n = s.save_node(text, 1, &HashMap::new(), false).unwrap();
            s.set_working_memory(robot.id, n.node_id, true).unwrap();
        }
        assert_eq!(s.clear_working_memory(robot.id).unwrap(), 3);
        assert!(s.working_set_ids(robot.id).unwrap().is_empty());
    }
}
