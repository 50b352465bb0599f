//! Scene repository: the `scenes` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_timestamp, parse_timestamp, placeholders, Database, DatabaseError};
use crate::model::{BoundingBox, ImagerySource, ProcessingStatus};
use crate::raster::Band;

const ENTITY: &str = "scene";

/// A raw scene row from the database.
#[derive(Debug, Clone)]
struct SceneRow {
    id: String,
    provider: String,
    scene_id: String,
    acquired_at: String,
    cloud_cover: f64,
    footprint: String,
    min_lon: f64,
    min_lat: f64,
    max_lon: f64,
    max_lat: f64,
    resolution_m: Option<f64>,
    bands: String,
    storage_uri: Option<String>,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SceneRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            provider: row.get("provider")?,
            scene_id: row.get("scene_id")?,
            acquired_at: row.get("acquired_at")?,
            cloud_cover: row.get("cloud_cover")?,
            footprint: row.get("footprint")?,
            min_lon: row.get("min_lon")?,
            min_lat: row.get("min_lat")?,
            max_lon: row.get("max_lon")?,
            max_lat: row.get("max_lat")?,
            resolution_m: row.get("resolution_m")?,
            bands: row.get("bands")?,
            storage_uri: row.get("storage_uri")?,
            status: row.get("status")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_model(self) -> Result<ImagerySource, DatabaseError> {
        let corrupt = |reason: String| DatabaseError::Corrupt {
            entity: ENTITY,
            id: self.id.clone(),
            reason,
        };
        let footprint = serde_json::from_str(&self.footprint)
            .map_err(|e| corrupt(format!("footprint: {}", e)))?;
        let bands: Vec<Band> =
            serde_json::from_str(&self.bands).map_err(|e| corrupt(format!("bands: {}", e)))?;
        let status = self.status.parse::<ProcessingStatus>().map_err(corrupt)?;

        Ok(ImagerySource {
            acquired_at: parse_timestamp(ENTITY, &self.id, &self.acquired_at)?,
            created_at: parse_timestamp(ENTITY, &self.id, &self.created_at)?,
            updated_at: parse_timestamp(ENTITY, &self.id, &self.updated_at)?,
            bbox: BoundingBox::new(self.min_lon, self.min_lat, self.max_lon, self.max_lat),
            id: self.id,
            provider: self.provider,
            scene_id: self.scene_id,
            cloud_cover: self.cloud_cover,
            footprint,
            resolution_m: self.resolution_m,
            bands,
            storage_uri: self.storage_uri,
            status,
            error: self.error,
        })
    }
}

/// Query filter parameters for scene listing.
#[derive(Debug, Default, Clone)]
pub struct SceneFilter {
    pub provider: Option<String>,
    pub status: Option<ProcessingStatus>,
    /// Scenes whose extent intersects this box.
    pub bbox: Option<BoundingBox>,
    pub acquired_from: Option<DateTime<Utc>>,
    pub acquired_to: Option<DateTime<Utc>>,
    pub max_cloud_cover: Option<f64>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

fn select_one(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Option<ImagerySource>, DatabaseError> {
    conn.query_row(sql, params, SceneRow::from_row)
        .optional()?
        .map(SceneRow::into_model)
        .transpose()
}

/// Inserts a newly discovered scene, or returns the existing record for the
/// same `(provider, scene_id)`. The flag is `true` when a row was inserted.
pub fn insert_or_get(
    db: &Database,
    scene: &ImagerySource,
) -> Result<(ImagerySource, bool), DatabaseError> {
    let bands = serde_json::to_string(&scene.bands).map_err(|e| DatabaseError::Corrupt {
        entity: ENTITY,
        id: scene.id.clone(),
        reason: e.to_string(),
    })?;
    db.with_conn(|conn| {
        let inserted = conn.execute(
            "INSERT INTO scenes (id, provider, scene_id, acquired_at, cloud_cover, footprint,
             min_lon, min_lat, max_lon, max_lat, resolution_m, bands, storage_uri, status,
             error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT (provider, scene_id) DO NOTHING",
            params![
                scene.id,
                scene.provider,
                scene.scene_id,
                format_timestamp(&scene.acquired_at),
                scene.cloud_cover,
                scene.footprint.to_string(),
                scene.bbox.min_lon,
                scene.bbox.min_lat,
                scene.bbox.max_lon,
                scene.bbox.max_lat,
                scene.resolution_m,
                bands,
                scene.storage_uri,
                scene.status.as_str(),
                scene.error,
                format_timestamp(&scene.created_at),
                format_timestamp(&scene.updated_at),
            ],
        )? == 1;

        let stored = select_one(
            conn,
            "SELECT * FROM scenes WHERE provider = ?1 AND scene_id = ?2",
            params![scene.provider, scene.scene_id],
        )?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: ENTITY,
            id: scene.scene_id.clone(),
        })?;
        Ok((stored, inserted))
    })
}

/// Finds a scene by its catalog id.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ImagerySource>, DatabaseError> {
    db.with_conn(|conn| select_one(conn, "SELECT * FROM scenes WHERE id = ?1", params![id]))
}

/// Finds a scene by its provider-side identifier.
pub fn find_by_scene_id(
    db: &Database,
    provider: &str,
    scene_id: &str,
) -> Result<Option<ImagerySource>, DatabaseError> {
    db.with_conn(|conn| {
        select_one(
            conn,
            "SELECT * FROM scenes WHERE provider = ?1 AND scene_id = ?2",
            params![provider, scene_id],
        )
    })
}

/// Queries scenes with filters, returning (scenes, total_count). Newest
/// acquisitions first.
pub fn query(
    db: &Database,
    filter: &SceneFilter,
) -> Result<(Vec<ImagerySource>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref provider) = filter.provider {
            conditions.push(format!("provider = ?{}", param_values.len() + 1));
            param_values.push(Box::new(provider.clone()));
        }
        if let Some(status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.as_str()));
        }
        if let Some(bbox) = filter.bbox {
            let n = param_values.len();
            conditions.push(format!(
                "min_lon <= ?{} AND max_lon >= ?{} AND min_lat <= ?{} AND max_lat >= ?{}",
                n + 1,
                n + 2,
                n + 3,
                n + 4
            ));
            param_values.push(Box::new(bbox.max_lon));
            param_values.push(Box::new(bbox.min_lon));
            param_values.push(Box::new(bbox.max_lat));
            param_values.push(Box::new(bbox.min_lat));
        }
        if let Some(ref from) = filter.acquired_from {
            conditions.push(format!("acquired_at >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(format_timestamp(from)));
        }
        if let Some(ref to) = filter.acquired_to {
            conditions.push(format!("acquired_at <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(format_timestamp(to)));
        }
        if let Some(max_cloud) = filter.max_cloud_cover {
            conditions.push(format!("cloud_cover <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(max_cloud));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM scenes {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM scenes {} ORDER BY acquired_at DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), SceneRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let scenes = rows
            .into_iter()
            .map(SceneRow::into_model)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((scenes, total))
    })
}

/// Counts scenes with the given status.
pub fn count_by_status(db: &Database, status: ProcessingStatus) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM scenes WHERE status = ?1",
            params![status.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Compare-and-set update: sets the new status (plus an error message or
/// storage key when given) only if the scene currently sits in one of
/// `next`'s predecessor states.
fn transition(
    db: &Database,
    id: &str,
    next: ProcessingStatus,
    error: Option<&str>,
    storage_uri: Option<&str>,
) -> Result<ImagerySource, DatabaseError> {
    let allowed = ProcessingStatus::predecessors(next);
    db.with_conn(|conn| {
        let mut changed = 0;
        if !allowed.is_empty() {
            let sql = format!(
                "UPDATE scenes SET status = ?1, updated_at = ?2,
                 error = COALESCE(?3, error), storage_uri = COALESCE(?4, storage_uri)
                 WHERE id = ?5 AND status IN ({})",
                placeholders(6, allowed.len())
            );
            let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
                Box::new(next.as_str()),
                Box::new(format_timestamp(&Utc::now())),
                Box::new(error.map(str::to_string)),
                Box::new(storage_uri.map(str::to_string)),
                Box::new(id.to_string()),
            ];
            param_values.extend(
                allowed
                    .iter()
                    .map(|s| Box::new(s.as_str()) as Box<dyn rusqlite::types::ToSql>),
            );
            let params_ref: Vec<&dyn rusqlite::types::ToSql> =
                param_values.iter().map(|p| p.as_ref()).collect();
            changed = conn.execute(&sql, params_ref.as_slice())?;
        }

        let current = select_one(conn, "SELECT * FROM scenes WHERE id = ?1", params![id])?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: ENTITY,
                id: id.to_string(),
            })?;
        if changed == 0 {
            return Err(DatabaseError::InvalidTransition {
                entity: ENTITY,
                id: id.to_string(),
                from: current.status.to_string(),
                to: next.to_string(),
            });
        }
        log::debug!("Scene {} moved to {}", id, next);
        Ok(current)
    })
}

/// Advances a scene along `raw -> corrected -> ready`.
pub fn advance_status(
    db: &Database,
    id: &str,
    next: ProcessingStatus,
) -> Result<ImagerySource, DatabaseError> {
    transition(db, id, next, None, None)
}

/// Marks a scene `ready` and records where its analysis-ready raster lives.
pub fn mark_ready(
    db: &Database,
    id: &str,
    storage_uri: &str,
) -> Result<ImagerySource, DatabaseError> {
    transition(db, id, ProcessingStatus::Ready, None, Some(storage_uri))
}

/// Marks a non-terminal scene `failed` with an error message.
pub fn mark_failed(
    db: &Database,
    id: &str,
    error: &str,
) -> Result<ImagerySource, DatabaseError> {
    transition(db, id, ProcessingStatus::Failed, Some(error), None)
}
