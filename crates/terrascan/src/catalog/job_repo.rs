//! Job repository: the `analysis_jobs` and `job_scenes` tables.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use super::{feature_repo, format_timestamp, parse_timestamp, placeholders, Database, DatabaseError};
use crate::model::{AnalysisJob, JobStatus, VectorFeature};

const ENTITY: &str = "job";

/// A raw job row from the database.
#[derive(Debug, Clone)]
struct JobRow {
    id: String,
    owner: String,
    kind: String,
    status: String,
    error: Option<String>,
    result_uri: Option<String>,
    summary: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            owner: row.get("owner")?,
            kind: row.get("kind")?,
            status: row.get("status")?,
            error: row.get("error")?,
            result_uri: row.get("result_uri")?,
            summary: row.get("summary")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    fn into_model(self, scene_ids: Vec<String>) -> Result<AnalysisJob, DatabaseError> {
        let corrupt = |reason: String| DatabaseError::Corrupt {
            entity: ENTITY,
            id: self.id.clone(),
            reason,
        };
        let kind = serde_json::from_str(&self.kind).map_err(|e| corrupt(format!("kind: {}", e)))?;
        let summary = self
            .summary
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(|e| corrupt(format!("summary: {}", e)))?;
        let status = self.status.parse::<JobStatus>().map_err(corrupt)?;
        let started_at = self
            .started_at
            .as_deref()
            .map(|ts| parse_timestamp(ENTITY, &self.id, ts))
            .transpose()?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(|ts| parse_timestamp(ENTITY, &self.id, ts))
            .transpose()?;

        Ok(AnalysisJob {
            created_at: parse_timestamp(ENTITY, &self.id, &self.created_at)?,
            id: self.id,
            owner: self.owner,
            kind,
            scene_ids,
            status,
            error: self.error,
            result_uri: self.result_uri,
            summary,
            started_at,
            completed_at,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub owner: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

fn scene_ids(conn: &Connection, job_id: &str) -> Result<Vec<String>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT scene_id FROM job_scenes WHERE job_id = ?1 ORDER BY position")?;
    let ids = stmt
        .query_map(params![job_id], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn load(conn: &Connection, id: &str) -> Result<Option<AnalysisJob>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM analysis_jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?;
    match row {
        Some(row) => {
            let scenes = scene_ids(conn, &row.id)?;
            Ok(Some(row.into_model(scenes)?))
        }
        None => Ok(None),
    }
}

fn to_json(id: &str, value: &impl serde::Serialize) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Corrupt {
        entity: ENTITY,
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Inserts a new job together with its ordered scene links.
pub fn insert(db: &Database, job: &AnalysisJob) -> Result<(), DatabaseError> {
    let kind = to_json(&job.id, &job.kind)?;
    let summary = job
        .summary
        .as_ref()
        .map(|s| to_json(&job.id, s))
        .transpose()?;
    db.with_tx(|tx| {
        tx.execute(
            "INSERT INTO analysis_jobs (id, owner, kind, status, error, result_uri, summary,
             created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.id,
                job.owner,
                kind,
                job.status.as_str(),
                job.error,
                job.result_uri,
                summary,
                format_timestamp(&job.created_at),
                job.started_at.as_ref().map(format_timestamp),
                job.completed_at.as_ref().map(format_timestamp),
            ],
        )?;
        for (position, scene_id) in job.scene_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO job_scenes (job_id, position, scene_id) VALUES (?1, ?2, ?3)",
                params![job.id, position as i64, scene_id],
            )?;
        }
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<AnalysisJob>, DatabaseError> {
    db.with_conn(|conn| load(conn, id))
}

/// Queries jobs with filters, returning (jobs, total_count). Newest first.
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<AnalysisJob>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref owner) = filter.owner {
            conditions.push(format!("owner = ?{}", param_values.len() + 1));
            param_values.push(Box::new(owner.clone()));
        }
        if let Some(status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.as_str()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM analysis_jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM analysis_jobs {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let scenes = scene_ids(conn, &row.id)?;
            jobs.push(row.into_model(scenes)?);
        }
        Ok((jobs, total))
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: JobStatus) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM analysis_jobs WHERE status = ?1",
            params![status.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Fields written alongside a status change.
#[derive(Debug, Default)]
struct Outcome<'a> {
    error: Option<&'a str>,
    result_uri: Option<&'a str>,
    summary: Option<String>,
}

fn transition_with(
    db: &Database,
    id: &str,
    next: JobStatus,
    outcome: Outcome<'_>,
) -> Result<AnalysisJob, DatabaseError> {
    db.with_conn(|conn| transition_on(conn, id, next, outcome))
}

/// Compare-and-set status update. Sets `started_at` on entering `running`
/// and `completed_at` on entering a terminal state.
fn transition_on(
    conn: &Connection,
    id: &str,
    next: JobStatus,
    outcome: Outcome<'_>,
) -> Result<AnalysisJob, DatabaseError> {
    let allowed = JobStatus::predecessors(next);
    let mut changed = 0;
    if !allowed.is_empty() {
        let now = format_timestamp(&Utc::now());
        let sql = format!(
            "UPDATE analysis_jobs SET status = ?1,
             started_at = CASE WHEN ?1 = 'running' THEN ?2 ELSE started_at END,
             completed_at = CASE WHEN ?3 THEN ?2 ELSE completed_at END,
             error = COALESCE(?4, error),
             result_uri = COALESCE(?5, result_uri),
             summary = COALESCE(?6, summary)
             WHERE id = ?7 AND status IN ({})",
            placeholders(8, allowed.len())
        );
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
            Box::new(next.as_str()),
            Box::new(now),
            Box::new(next.is_terminal()),
            Box::new(outcome.error.map(str::to_string)),
            Box::new(outcome.result_uri.map(str::to_string)),
            Box::new(outcome.summary),
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

    let current = load(conn, id)?.ok_or_else(|| DatabaseError::NotFound {
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
    log::debug!("Job {} moved to {}", id, next);
    Ok(current)
}

/// Moves a job to `next` if the state machine allows it from the job's
/// current state. `error` is recorded when given.
pub fn transition(
    db: &Database,
    id: &str,
    next: JobStatus,
    error: Option<&str>,
) -> Result<AnalysisJob, DatabaseError> {
    transition_with(
        db,
        id,
        next,
        Outcome {
            error,
            ..Default::default()
        },
    )
}

/// Marks a running job `completed` with its result fields and stores the
/// features it produced, in one transaction. A job that already left
/// `running` gets `InvalidTransition` and no features are written.
pub fn complete(
    db: &Database,
    id: &str,
    result_uri: Option<&str>,
    summary: &Value,
    features: &[VectorFeature],
) -> Result<AnalysisJob, DatabaseError> {
    let summary = to_json(id, summary)?;
    db.with_tx(|tx| {
        let job = transition_on(
            tx,
            id,
            JobStatus::Completed,
            Outcome {
                result_uri,
                summary: Some(summary),
                ..Default::default()
            },
        )?;
        let stored = feature_repo::insert_all(tx, features)?;
        if stored > 0 {
            log::debug!("Stored {} features for job {}", stored, id);
        }
        Ok(job)
    })
}

/// Fails every job left `pending` or `running` by a previous process.
/// Returns the ids of the jobs that were failed.
pub fn fail_interrupted(db: &Database, message: &str) -> Result<Vec<String>, DatabaseError> {
    db.with_tx(|tx| {
        let mut stmt =
            tx.prepare("SELECT id FROM analysis_jobs WHERE status IN ('pending', 'running')")?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        drop(stmt);

        let now = format_timestamp(&Utc::now());
        tx.execute(
            "UPDATE analysis_jobs SET status = 'failed', error = ?1, completed_at = ?2
             WHERE status IN ('pending', 'running')",
            params![message, now],
        )?;
        Ok(ids)
    })
}
