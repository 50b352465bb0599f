//! Vector feature repository. Features are write-once: there is no update
//! or delete.

use rusqlite::{params, Connection, Row};

use super::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::model::VectorFeature;

const ENTITY: &str = "feature";

/// A raw feature row from the database.
#[derive(Debug, Clone)]
struct FeatureRow {
    id: String,
    job_id: String,
    kind: String,
    geometry: String,
    properties: String,
    created_at: String,
}

impl FeatureRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            kind: row.get("kind")?,
            geometry: row.get("geometry")?,
            properties: row.get("properties")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_model(self) -> Result<VectorFeature, DatabaseError> {
        let corrupt = |field: &str, e: serde_json::Error| DatabaseError::Corrupt {
            entity: ENTITY,
            id: self.id.clone(),
            reason: format!("{}: {}", field, e),
        };
        let geometry = serde_json::from_str(&self.geometry).map_err(|e| corrupt("geometry", e))?;
        let properties =
            serde_json::from_str(&self.properties).map_err(|e| corrupt("properties", e))?;
        Ok(VectorFeature {
            created_at: parse_timestamp(ENTITY, &self.id, &self.created_at)?,
            id: self.id,
            job_id: self.job_id,
            kind: self.kind,
            geometry,
            properties,
        })
    }
}

fn insert_one(conn: &Connection, feature: &VectorFeature) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO vector_features (id, job_id, kind, geometry, properties, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            feature.id,
            feature.job_id,
            feature.kind,
            feature.geometry.to_string(),
            feature.properties.to_string(),
            format_timestamp(&feature.created_at),
        ],
    )?;
    Ok(())
}

/// Inserts a single feature.
pub fn insert(db: &Database, feature: &VectorFeature) -> Result<(), DatabaseError> {
    db.with_conn(|conn| insert_one(conn, feature))
}

/// Inserts a batch of features atomically.
pub fn insert_many(db: &Database, features: &[VectorFeature]) -> Result<usize, DatabaseError> {
    db.with_tx(|tx| insert_all(tx, features))
}

/// Inserts features on a connection the caller already holds, typically
/// inside a larger transaction.
pub(crate) fn insert_all(
    conn: &Connection,
    features: &[VectorFeature],
) -> Result<usize, DatabaseError> {
    for feature in features {
        insert_one(conn, feature)?;
    }
    Ok(features.len())
}

/// Lists every feature produced by a job, oldest first.
pub fn list_by_job(db: &Database, job_id: &str) -> Result<Vec<VectorFeature>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM vector_features WHERE job_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![job_id], FeatureRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(FeatureRow::into_model).collect()
    })
}

/// Counts the features produced by a job.
pub fn count_by_job(db: &Database, job_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM vector_features WHERE job_id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
