//! Dashboard-control REST surface.
//!
//! Every authenticated route accepts the session token either as a `token`
//! query parameter or as a bearer header; the two are equivalent. Errors
//! render as the stable `{"error": msg}` shape: 401 for auth and validation
//! failures, 404 for lookups that come up empty.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use echotrap_core::{
    subdomain, DnsRecordInput, Error, ResponseFile, ResponseNode, ResponseTree, INDEX_FILE,
};

use crate::AppState;

lazy_static! {
    static ref DOMAIN_RE: Regex =
        Regex::new("^[A-Za-z0-9](?:[A-Za-z0-9._-]{0,61}[A-Za-z0-9])?$").expect("valid regex");
    static ref PRINTABLE_RE: Regex = Regex::new("^[ -~]+$").expect("valid regex");
}

/// Surface-level error wrapper mapping the shared error kinds to HTTP.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Auth(_) | Error::Validation(_) => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub token: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Deserialize)]
pub struct SharedQuery {
    pub subdomain: String,
    pub id: String,
}

#[derive(Deserialize)]
pub struct DeleteBody {
    pub id: String,
}

#[derive(Deserialize)]
pub struct DnsRecordsBody {
    pub records: Vec<DnsRecordInput>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Resolve the caller's subdomain from a query token or bearer header.
pub fn authenticate(
    state: &AppState,
    query_token: Option<&str>,
    headers: &HeaderMap,
) -> Result<String, ApiError> {
    let token = query_token
        .map(str::to_string)
        .or_else(|| bearer_token(headers))
        .ok_or_else(|| Error::Auth("Invalid token".to_string()))?;
    Ok(state.tokens.verify(&token)?)
}

/// `POST /api/get_token` — mint a session: fresh subdomain, seeded response
/// tree, signed token.
pub async fn get_token(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let sub = state.sessions.mint_subdomain().await?;
    let token = state.tokens.issue(&sub)?;
    Ok(Json(json!({ "token": token, "subdomain": sub })))
}

/// `GET /api/get_file` — the `index.html` leaf.
pub async fn get_file(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<ResponseFile>, ApiError> {
    let sub = authenticate(&state, query.token.as_deref(), &headers)?;
    let tree = state.sessions.tree(&sub).await?;
    match tree.0.get(INDEX_FILE) {
        Some(ResponseNode::File(file)) => Ok(Json(file.clone())),
        _ => Err(Error::NotFound("file").into()),
    }
}

/// `POST /api/update_file` — replace the `index.html` leaf.
pub async fn update_file(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(file): Json<ResponseFile>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sub = authenticate(&state, query.token.as_deref(), &headers)?;
    if file.raw.len() > state.config.max_file_size {
        return Err(Error::Validation("Response too large".to_string()).into());
    }

    let mut tree = state.sessions.tree(&sub).await?;
    tree.0
        .insert(INDEX_FILE.to_string(), ResponseNode::File(file));
    state.sessions.put_tree(&sub, &tree).await?;
    Ok(Json(json!({ "msg": "Updated response" })))
}

/// `GET /api/files` — the whole response tree.
pub async fn get_files(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<ResponseTree>, ApiError> {
    let sub = authenticate(&state, query.token.as_deref(), &headers)?;
    Ok(Json(state.sessions.tree(&sub).await?))
}

/// `POST /api/files` — replace the whole response tree atomically.
pub async fn update_files(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(raw_tree): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sub = authenticate(&state, query.token.as_deref(), &headers)?;

    let tree: ResponseTree = serde_json::from_value(raw_tree)
        .map_err(|_| Error::Validation("Invalid file structure".to_string()))?;
    tree.validate(state.config.max_file_size)?;

    state.sessions.put_tree(&sub, &tree).await?;
    Ok(Json(json!({ "msg": "Updated files" })))
}

/// `GET /api/get_dns` — the aggregate record list.
pub async fn get_dns(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sub = authenticate(&state, query.token.as_deref(), &headers)?;
    let records = state.sessions.dns_records(&sub).await?;
    Ok(Json(serde_json::to_value(records).unwrap_or_default()))
}

fn validate_dns_record(record: &DnsRecordInput) -> Result<(), Error> {
    let domain = record.domain.to_lowercase();
    let value = &record.value;

    if domain.len() > 63 {
        return Err(Error::Validation(format!(
            "Domain name '{}' too long",
            domain
        )));
    }
    if value.len() > 255 {
        return Err(Error::Validation(format!("Value '{}' too long", value)));
    }
    if !(0..4).contains(&record.record_type) {
        return Err(Error::Validation(format!(
            "Invalid type for domain {}",
            domain
        )));
    }
    // TXT values are unrestricted; everything else stays printable ASCII.
    if record.record_type != 3 && !PRINTABLE_RE.is_match(value) {
        return Err(Error::Validation(format!(
            "Invalid characters in value '{}'",
            value
        )));
    }
    if !DOMAIN_RE.is_match(&domain) {
        return Err(Error::Validation(format!(
            "Invalid characters in domain '{}'",
            domain
        )));
    }
    Ok(())
}

/// `POST /api/update_dns` — validate, then replace the aggregate and the
/// resolver buckets. The first invalid record rejects the whole submission;
/// nothing is persisted.
pub async fn update_dns(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<DnsRecordsBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sub = authenticate(&state, query.token.as_deref(), &headers)?;

    // Blank dashboard rows carry neither domain nor value; drop them.
    let records: Vec<&DnsRecordInput> = body
        .records
        .iter()
        .filter(|r| !(r.domain.is_empty() && r.value.is_empty()))
        .collect();
    for record in &records {
        validate_dns_record(record)?;
    }

    let records: Vec<DnsRecordInput> = records.into_iter().cloned().collect();
    state.sessions.replace_dns_records(&sub, &records).await?;
    Ok(Json(json!({ "msg": "Updated DNS records" })))
}

/// `GET /api/requests` — the `(limit, offset)` window of captures,
/// tombstones skipped.
pub async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let sub = authenticate(&state, query.token.as_deref(), &headers)?;
    let captures = state
        .sessions
        .list_captures(&sub, query.limit.unwrap_or(0), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(captures))
}

/// `GET /api/get_request` — one capture by `(subdomain, id)`. Shared links
/// carry no token; malformed coordinates read as not-found.
pub async fn get_request(
    State(state): State<AppState>,
    Query(query): Query<SharedQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if Uuid::parse_str(&query.id).is_err() {
        return Err(Error::NotFound("request").into());
    }
    if !subdomain::is_valid(
        &query.subdomain,
        &state.config.subdomain_alphabet,
        state.config.subdomain_length,
    ) {
        return Err(Error::NotFound("subdomain").into());
    }

    match state
        .sessions
        .capture_by_id(&query.subdomain, &query.id)
        .await?
    {
        Some(capture) => Ok(Json(capture)),
        None => Err(Error::NotFound("request").into()),
    }
}

/// `POST /api/delete_request` — tombstone one capture.
pub async fn delete_request(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<DeleteBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sub = authenticate(&state, query.token.as_deref(), &headers)?;
    state.sessions.tombstone(&sub, &body.id).await?;
    Ok(Json(json!({ "msg": "Deleted request" })))
}

/// `POST /api/delete_all` — purge the capture list and secondary indexes.
pub async fn delete_all(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sub = authenticate(&state, query.token.as_deref(), &headers)?;
    state.sessions.purge_captures(&sub).await?;
    Ok(Json(json!({ "msg": "Deleted all requests" })))
}
