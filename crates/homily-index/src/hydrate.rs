//! Batched resolution of vector hit ids into paragraph metadata.

use std::collections::{HashMap, HashSet};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use tracing::debug;

use crate::error::StorageError;
use crate::vector::SemanticHit;

/// Bound parameters per lookup statement, under SQLite's historical limit.
const CHUNK_SIZE: usize = 500;

/// Display metadata for one block id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HydratedRecord {
    pub block_uid: String,
    pub paragraph_uid: String,
    pub section_uid: String,
    pub sermon_uid: String,
    pub paragraph_text: String,
    pub sermon_title: String,
    pub sermon_date: Option<String>,
}

/// A semantic hit joined with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedHit {
    #[serde(flatten)]
    pub record: HydratedRecord,
    pub similarity: f64,
    pub distance: Option<f64>,
    pub score: Option<f64>,
}

/// Resolve block ids in one batched lookup per chunk, never one per id.
///
/// Ids with no matching block are absent from the map.
pub fn resolve(conn: &Connection, ids: &[String]) -> Result<HashMap<String, HydratedRecord>, StorageError> {
    let mut seen = HashSet::with_capacity(ids.len());
    let unique: Vec<&String> = ids.iter().filter(|id| seen.insert(id.as_str())).collect();

    let mut records = HashMap::with_capacity(unique.len());
    for chunk in unique.chunks(CHUNK_SIZE) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT b.uid, b.paragraph_uid, b.section_uid, b.sermon_uid,
                    COALESCE(pt.text, b.text), ser.title, ser.date
             FROM blocks b
             JOIN sermons ser ON ser.uid = b.sermon_uid
             LEFT JOIN paragraphs_text pt ON pt.uid = b.paragraph_uid
             WHERE b.uid IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params = chunk.iter().map(|id| SqlValue::Text((*id).clone()));
        let rows = stmt.query_map(params_from_iter(params), |row| {
            Ok(HydratedRecord {
                block_uid: row.get(0)?,
                paragraph_uid: row.get(1)?,
                section_uid: row.get(2)?,
                sermon_uid: row.get(3)?,
                paragraph_text: row.get(4)?,
                sermon_title: row.get(5)?,
                sermon_date: row.get(6)?,
            })
        })?;
        for row in rows {
            let record = row?;
            records.insert(record.block_uid.clone(), record);
        }
    }

    debug!(requested = unique.len(), resolved = records.len(), "Hydrated semantic hits");
    Ok(records)
}

/// Attach metadata to hits, keeping hit order and dropping unresolved ids.
pub fn attach(hits: Vec<SemanticHit>, records: &HashMap<String, HydratedRecord>) -> Vec<ResolvedHit> {
    hits.into_iter()
        .filter_map(|hit| {
            records.get(&hit.id).map(|record| ResolvedHit {
                record: record.clone(),
                similarity: hit.similarity,
                distance: hit.distance,
                score: hit.score,
            })
        })
        .collect()
}
