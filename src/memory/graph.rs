//! Knowledge graph — entities and directed relationships extracted from
//! observation narratives.
//!
//! Entities are addressed by `(type, name)` with case-insensitive dedupe
//! (NOCASE collation on the name column). Relationships carry the
//! observation id that introduced them as provenance, and the full triple is
//! deduplicated so re-extraction is idempotent.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::Result;
use crate::memory::types::{Entity, Relationship};

/// Insert an entity or return the existing row for `(type, name)`.
pub fn upsert_entity(
    conn: &Connection,
    entity_type: &str,
    name: &str,
    description: Option<&str>,
) -> Result<Entity> {
    if let Some(existing) = find_entity(conn, entity_type, name)? {
        if let (Some(desc), None) = (description, existing.description.as_deref()) {
            conn.execute(
                "UPDATE entities SET description = ?1 WHERE id = ?2",
                params![desc, existing.id],
            )?;
        }
        return require_entity(conn, entity_type, name);
    }

    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO entities (id, entity_type, name, description, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, entity_type, name, description, now],
    )?;

    require_entity(conn, entity_type, name)
}

fn require_entity(conn: &Connection, entity_type: &str, name: &str) -> Result<Entity> {
    find_entity(conn, entity_type, name)?.ok_or_else(|| {
        crate::error::MemError::Internal(format!("entity ({entity_type}, {name}) vanished"))
    })
}

pub fn find_entity(conn: &Connection, entity_type: &str, name: &str) -> Result<Option<Entity>> {
    Ok(conn
        .query_row(
            "SELECT id, entity_type, name, description, created_at \
             FROM entities WHERE entity_type = ?1 AND name = ?2 COLLATE NOCASE",
            params![entity_type, name],
            row_to_entity,
        )
        .optional()?)
}

/// Record a directed relationship. Idempotent on the full triple; the first
/// introducing observation wins as provenance.
pub fn link(
    conn: &Connection,
    from_entity_id: &str,
    relationship_type: &str,
    to_entity_id: &str,
    observation_id: &str,
) -> Result<Relationship> {
    let existing: Option<Relationship> = conn
        .query_row(
            "SELECT id, from_entity_id, relationship_type, to_entity_id, observation_id, created_at \
             FROM entity_relationships \
             WHERE from_entity_id = ?1 AND relationship_type = ?2 AND to_entity_id = ?3",
            params![from_entity_id, relationship_type, to_entity_id],
            row_to_relationship,
        )
        .optional()?;
    if let Some(rel) = existing {
        return Ok(rel);
    }

    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO entity_relationships \
         (id, from_entity_id, relationship_type, to_entity_id, observation_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            from_entity_id,
            relationship_type,
            to_entity_id,
            observation_id,
            now
        ],
    )?;

    Ok(Relationship {
        id,
        from_entity_id: from_entity_id.to_string(),
        relationship_type: relationship_type.to_string(),
        to_entity_id: to_entity_id.to_string(),
        observation_id: observation_id.to_string(),
        created_at: now,
    })
}

/// One hop of the neighbourhood around an entity.
#[derive(Debug, Clone, Serialize)]
pub struct Neighbour {
    pub entity: Entity,
    pub relationship_type: String,
    /// Observation that introduced the linking edge.
    pub observation_id: String,
    /// Hops from the start entity (1..=depth).
    pub depth: usize,
}

/// Breadth-first neighbourhood of an entity name (any type), bounded at
/// `depth` ≤ 2 hops. Edges are traversed in both directions.
pub fn neighbours(conn: &Connection, entity_name: &str, depth: usize) -> Result<Vec<Neighbour>> {
    let depth = depth.min(2);

    let mut starts: Vec<Entity> = {
        let mut stmt = conn.prepare(
            "SELECT id, entity_type, name, description, created_at \
             FROM entities WHERE name = ?1 COLLATE NOCASE",
        )?;
        let rows = stmt
            .query_map(params![entity_name], row_to_entity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    if starts.is_empty() || depth == 0 {
        return Ok(Vec::new());
    }

    let mut visited: HashSet<String> = starts.iter().map(|e| e.id.clone()).collect();
    let mut queue: VecDeque<(String, usize)> =
        starts.drain(..).map(|e| (e.id, 0)).collect();
    let mut found: Vec<Neighbour> = Vec::new();

    while let Some((entity_id, hops)) = queue.pop_front() {
        if hops >= depth {
            continue;
        }
        for (neighbour_id, relationship_type, observation_id) in edges_of(conn, &entity_id)? {
            if !visited.insert(neighbour_id.clone()) {
                continue;
            }
            if let Some(entity) = entity_by_id(conn, &neighbour_id)? {
                queue.push_back((neighbour_id, hops + 1));
                found.push(Neighbour {
                    entity,
                    relationship_type,
                    observation_id,
                    depth: hops + 1,
                });
            }
        }
    }

    Ok(found)
}

/// Observation ids referenced by edges around an entity name, used as the
/// graph signal in hybrid search.
pub fn observation_ids_near(
    conn: &Connection,
    entity_name: &str,
    depth: usize,
) -> Result<Vec<String>> {
    let found = neighbours(conn, entity_name, depth)?;
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for n in found {
        if seen.insert(n.observation_id.clone()) {
            ids.push(n.observation_id);
        }
    }
    Ok(ids)
}

/// Counts for the stats surface.
pub fn counts(conn: &Connection) -> Result<(u64, u64)> {
    let entities: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?;
    let relationships: i64 =
        conn.query_row("SELECT COUNT(*) FROM entity_relationships", [], |r| r.get(0))?;
    Ok((entities as u64, relationships as u64))
}

fn edges_of(conn: &Connection, entity_id: &str) -> Result<Vec<(String, String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT to_entity_id, relationship_type, observation_id \
         FROM entity_relationships WHERE from_entity_id = ?1 \
         UNION ALL \
         SELECT from_entity_id, relationship_type, observation_id \
         FROM entity_relationships WHERE to_entity_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![entity_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn entity_by_id(conn: &Connection, id: &str) -> Result<Option<Entity>> {
    Ok(conn
        .query_row(
            "SELECT id, entity_type, name, description, created_at FROM entities WHERE id = ?1",
            params![id],
            row_to_entity,
        )
        .optional()?)
}

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_relationship(row: &rusqlite::Row<'_>) -> rusqlite::Result<Relationship> {
    Ok(Relationship {
        id: row.get(0)?,
        from_entity_id: row.get(1)?,
        relationship_type: row.get(2)?,
        to_entity_id: row.get(3)?,
        observation_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Group a neighbour list by relationship type, for display surfaces.
pub fn group_by_relationship(found: &[Neighbour]) -> HashMap<String, Vec<&Neighbour>> {
    let mut grouped: HashMap<String, Vec<&Neighbour>> = HashMap::new();
    for n in found {
        grouped
            .entry(n.relationship_type.clone())
            .or_default()
            .push(n);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_db() -> Connection {
        db::open_memory_database().unwrap()
    }

    #[test]
    fn entity_dedupe_is_case_insensitive() {
        let conn = test_db();
        let a = upsert_entity(&conn, "concept", "Authentication", None).unwrap();
        let b = upsert_entity(&conn, "concept", "authentication", None).unwrap();
        assert_eq!(a.id, b.id);

        // Different type is a different entity.
        let c = upsert_entity(&conn, "file", "authentication", None).unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn link_is_idempotent_on_triple() {
        let conn = test_db();
        let a = upsert_entity(&conn, "concept", "JWT", None).unwrap();
        let b = upsert_entity(&conn, "file", "src/auth.ts", None).unwrap();

        let r1 = link(&conn, &a.id, "relates_to", &b.id, "obs-1").unwrap();
        let r2 = link(&conn, &a.id, "relates_to", &b.id, "obs-2").unwrap();
        assert_eq!(r1.id, r2.id);
        // First introduction wins as provenance.
        assert_eq!(r2.observation_id, "obs-1");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM entity_relationships", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn neighbours_respects_depth() {
        let conn = test_db();
        let a = upsert_entity(&conn, "concept", "auth", None).unwrap();
        let b = upsert_entity(&conn, "file", "src/auth.ts", None).unwrap();
        let c = upsert_entity(&conn, "concept", "sessions", None).unwrap();
        link(&conn, &a.id, "relates_to", &b.id, "obs-1").unwrap();
        link(&conn, &b.id, "relates_to", &c.id, "obs-2").unwrap();

        let one_hop = neighbours(&conn, "auth", 1).unwrap();
        assert_eq!(one_hop.len(), 1);
        assert_eq!(one_hop[0].entity.name, "src/auth.ts");
        assert_eq!(one_hop[0].depth, 1);

        let two_hop = neighbours(&conn, "auth", 2).unwrap();
        assert_eq!(two_hop.len(), 2);
        let names: Vec<&str> = two_hop.iter().map(|n| n.entity.name.as_str()).collect();
        assert!(names.contains(&"sessions"));

        // Depth is clamped at 2, so asking for more changes nothing.
        assert_eq!(neighbours(&conn, "auth", 5).unwrap().len(), 2);
    }

    #[test]
    fn neighbours_traverse_reverse_edges() {
        let conn = test_db();
        let a = upsert_entity(&conn, "concept", "auth", None).unwrap();
        let b = upsert_entity(&conn, "file", "src/auth.ts", None).unwrap();
        link(&conn, &b.id, "mentions", &a.id, "obs-1").unwrap();

        let found = neighbours(&conn, "auth", 1).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity.name, "src/auth.ts");
    }

    #[test]
    fn observation_ids_near_dedupes() {
        let conn = test_db();
        let a = upsert_entity(&conn, "concept", "auth", None).unwrap();
        let b = upsert_entity(&conn, "file", "one.rs", None).unwrap();
        let c = upsert_entity(&conn, "file", "two.rs", None).unwrap();
        link(&conn, &a.id, "relates_to", &b.id, "obs-1").unwrap();
        link(&conn, &a.id, "relates_to", &c.id, "obs-1").unwrap();

        let ids = observation_ids_near(&conn, "auth", 1).unwrap();
        assert_eq!(ids, vec!["obs-1".to_string()]);
    }

    #[test]
    fn unknown_entity_has_no_neighbours() {
        let conn = test_db();
        assert!(neighbours(&conn, "ghost", 2).unwrap().is_empty());
    }
}
