//! STAC item search.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info_span, warn, Instrument};

use super::{create_http_client, status_error, RemoteError};
use crate::model::BoundingBox;
use crate::raster::Band;
use crate::sanitize;

/// A spatio-temporal scene search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub bbox: BoundingBox,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Maximum cloud cover in percent.
    pub max_cloud_cover: f64,
    #[serde(default)]
    pub collections: Vec<String>,
    /// Upper bound on the number of scenes returned.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn validate(&self) -> Result<(), RemoteError> {
        if !self.bbox.is_valid() {
            return Err(RemoteError::InvalidQuery(format!(
                "invalid bounding box {:?}",
                self.bbox.as_array()
            )));
        }
        if self.start > self.end {
            return Err(RemoteError::InvalidQuery(
                "start must not be after end".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.max_cloud_cover) {
            return Err(RemoteError::InvalidQuery(format!(
                "max_cloud_cover must be within [0, 100], got {}",
                self.max_cloud_cover
            )));
        }
        if self.limit == Some(0) {
            return Err(RemoteError::InvalidQuery("limit must be positive".to_string()));
        }
        Ok(())
    }

    /// Request body for `POST /search`.
    pub fn to_search_body(&self, page_size: usize) -> Value {
        let page_size = self.limit.map_or(page_size, |l| l.min(page_size));
        let mut body = json!({
            "bbox": self.bbox.as_array(),
            "datetime": format!("{}/{}", self.start.to_rfc3339(), self.end.to_rfc3339()),
            "limit": page_size,
            "query": { "eo:cloud_cover": { "lte": self.max_cloud_cover } },
        });
        if !self.collections.is_empty() {
            body["collections"] = json!(self.collections);
        }
        body
    }
}

/// A scene returned by a catalog search, before it enters the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneCandidate {
    /// Provider-side scene id.
    pub id: String,
    pub collection: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub cloud_cover: f64,
    pub footprint: Value,
    pub bbox: BoundingBox,
    pub resolution_m: Option<f64>,
    /// Download location for each recognised spectral band.
    pub assets: BTreeMap<Band, String>,
}

/// Scene discovery against a STAC-compliant catalog.
#[async_trait]
pub trait StacClient: Send + Sync {
    /// Provider name recorded on discovered scenes.
    fn provider(&self) -> &str;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SceneCandidate>, RemoteError>;
}

/// STAC API client using `POST /search` with pagination through `next`
/// links.
pub struct HttpStacClient {
    client: Client,
    endpoint: String,
    provider: String,
    token: Option<SecretString>,
    page_size: usize,
    max_pages: usize,
}

impl HttpStacClient {
    pub fn new(
        endpoint: &str,
        provider: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        Ok(Self {
            client: create_http_client(timeout)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            provider: provider.to_string(),
            token,
            page_size: 100,
            max_pages: 10,
        })
    }

    pub fn with_paging(mut self, page_size: usize, max_pages: usize) -> Self {
        self.page_size = page_size.max(1);
        self.max_pages = max_pages.max(1);
        self
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<Value, RemoteError> {
        let url = request.href.clone();
        let mut builder = match request.body {
            Some(body) => self.client.post(&url).json(&body),
            None => self.client.get(&url),
        };
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::http(&url, e))?;
        if !response.status().is_success() {
            return Err(status_error(&url, response).await);
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::invalid(&url, e.to_string()))
    }
}

struct PageRequest {
    href: String,
    body: Option<Value>,
}

#[async_trait]
impl StacClient for HttpStacClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SceneCandidate>, RemoteError> {
        query.validate()?;

        let first_body = query.to_search_body(self.page_size);
        let mut next = Some(PageRequest {
            href: format!("{}/search", self.endpoint),
            body: Some(first_body.clone()),
        });
        let mut candidates = Vec::new();
        let mut pages = 0;

        while let Some(request) = next.take() {
            if pages >= self.max_pages {
                debug!("Stopping STAC pagination after {} pages", pages);
                break;
            }
            pages += 1;

            let span = info_span!("stac_page", page = pages, url = %sanitize::redact_url(&request.href));
            let page = self.fetch_page(request).instrument(span).await?;
            let (items, next_link) = parse_feature_collection(&page)
                .map_err(|reason| RemoteError::invalid(&self.endpoint, reason))?;

            candidates.extend(
                items
                    .into_iter()
                    .filter(|c| c.cloud_cover <= query.max_cloud_cover),
            );
            if query.limit.is_some_and(|limit| candidates.len() >= limit) {
                break;
            }
            next = next_link.map(|link| link.into_request(&first_body));
        }

        if let Some(limit) = query.limit {
            candidates.truncate(limit);
        }
        debug!(
            "STAC search on {} returned {} scenes over {} pages",
            self.provider,
            candidates.len(),
            pages
        );
        Ok(candidates)
    }
}

/// A `rel=next` link.
#[derive(Debug, Clone, PartialEq)]
pub struct NextLink {
    pub href: String,
    pub method: String,
    pub body: Option<Value>,
    pub merge: bool,
}

impl NextLink {
    fn into_request(self, previous_body: &Value) -> PageRequest {
        if !self.method.eq_ignore_ascii_case("POST") {
            return PageRequest {
                href: self.href,
                body: None,
            };
        }
        let body = match (self.body, self.merge) {
            (Some(Value::Object(extra)), true) => {
                let mut merged = previous_body.clone();
                if let Value::Object(map) = &mut merged {
                    map.extend(extra);
                }
                merged
            }
            (Some(body), _) => body,
            (None, _) => previous_body.clone(),
        };
        PageRequest {
            href: self.href,
            body: Some(body),
        }
    }
}

/// Parses a STAC `FeatureCollection`. Features lacking an id, acquisition
/// time, cloud cover or geometry are skipped with a warning.
pub fn parse_feature_collection(
    page: &Value,
) -> Result<(Vec<SceneCandidate>, Option<NextLink>), String> {
    let features = page
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| "response has no 'features' array".to_string())?;

    let mut candidates = Vec::with_capacity(features.len());
    for feature in features {
        match parse_feature(feature) {
            Ok(candidate) => candidates.push(candidate),
            Err(reason) => {
                let id = feature.get("id").and_then(Value::as_str).unwrap_or("<no id>");
                warn!("Skipping STAC item {}: {}", id, reason);
            }
        }
    }

    let next = page
        .get("links")
        .and_then(Value::as_array)
        .and_then(|links| {
            links
                .iter()
                .find(|l| l.get("rel").and_then(Value::as_str) == Some("next"))
        })
        .and_then(|link| {
            Some(NextLink {
                href: link.get("href")?.as_str()?.to_string(),
                method: link
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or("GET")
                    .to_string(),
                body: link.get("body").cloned(),
                merge: link.get("merge").and_then(Value::as_bool).unwrap_or(false),
            })
        });

    Ok((candidates, next))
}

fn parse_feature(feature: &Value) -> Result<SceneCandidate, String> {
    let id = feature
        .get("id")
        .and_then(Value::as_str)
        .ok_or("missing id")?
        .to_string();
    let properties = feature.get("properties").ok_or("missing properties")?;
    let acquired_at = properties
        .get("datetime")
        .and_then(Value::as_str)
        .ok_or("missing datetime")
        .and_then(|s| {
            DateTime::parse_from_rfc3339(s).map_err(|_| "unparseable datetime")
        })?
        .with_timezone(&Utc);
    let cloud_cover = properties
        .get("eo:cloud_cover")
        .and_then(Value::as_f64)
        .ok_or("missing eo:cloud_cover")?;
    let footprint = feature
        .get("geometry")
        .filter(|g| !g.is_null())
        .cloned()
        .ok_or("missing geometry")?;

    let bbox = feature
        .get("bbox")
        .and_then(Value::as_array)
        .filter(|b| b.len() == 4)
        .and_then(|b| {
            Some(BoundingBox::from_array([
                b[0].as_f64()?,
                b[1].as_f64()?,
                b[2].as_f64()?,
                b[3].as_f64()?,
            ]))
        })
        .or_else(|| BoundingBox::from_geojson(&footprint))
        .ok_or("missing bbox")?;

    let assets = feature
        .get("assets")
        .and_then(Value::as_object)
        .map(|assets| {
            assets
                .iter()
                .filter_map(|(key, asset)| {
                    let band = Band::from_asset_key(key)?;
                    let href = asset.get("href")?.as_str()?;
                    Some((band, href.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(SceneCandidate {
        id,
        collection: feature
            .get("collection")
            .and_then(Value::as_str)
            .map(str::to_string),
        acquired_at,
        cloud_cover,
        footprint,
        bbox,
        resolution_m: properties.get("gsd").and_then(Value::as_f64),
        assets,
    })
}
