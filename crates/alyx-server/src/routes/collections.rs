use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use alyx_core::query::{Filter, FilterOp, ListQuery, Sort};
use alyx_core::types::FieldType;
use alyx_core::value::{document_to_json, Value};
use alyx_store::{ExpandedDocument, RequestContext, StoreError};

use crate::auth::OptionalAuth;
use crate::error::{ApiError, ErrorCode};
use crate::middleware::RequestMeta;
use crate::state::AppState;

/// `GET /api/collections/{collection}`: filtered, sorted, paginated
/// list. `filter` repeats as `field:op:value`.
pub async fn list(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    OptionalAuth(auth): OptionalAuth,
    meta: RequestMeta,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = meta.request_id.clone();
    let ctx = context("GET", &meta, auth);

    let query = parse_list_params(&state, &collection, &params, &request_id)?;
    let result = run_blocking(&request_id, {
        let state = state.clone();
        let collection = collection.clone();
        move || state.gateway.list(&collection, &query, &ctx)
    })
    .await?;

    Ok(Json(serde_json::json!({
        "docs": result.docs.iter().map(render_expanded).collect::<Vec<_>>(),
        "total": result.total,
        "limit": result.limit,
        "offset": result.offset,
    })))
}

/// `POST /api/collections/{collection}`: create; 201 on success.
pub async fn create(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    OptionalAuth(auth): OptionalAuth,
    meta: RequestMeta,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let request_id = meta.request_id.clone();
    let ctx = context("POST", &meta, auth);

    let doc = run_blocking(&request_id, {
        let state = state.clone();
        let collection = collection.clone();
        move || state.gateway.create(&collection, &body, &ctx)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(document_to_json(&doc))).into_response())
}

/// `GET /api/collections/{collection}/{id}`.
pub async fn get_one(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    OptionalAuth(auth): OptionalAuth,
    meta: RequestMeta,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = meta.request_id.clone();
    let ctx = context("GET", &meta, auth);

    let doc = run_blocking(&request_id, {
        let state = state.clone();
        move || state.gateway.get(&collection, &id, &ctx)
    })
    .await?;
    Ok(Json(document_to_json(&doc)))
}

/// `PATCH /api/collections/{collection}/{id}`: merge patch.
pub async fn update(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    OptionalAuth(auth): OptionalAuth,
    meta: RequestMeta,
    Json(patch): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = meta.request_id.clone();
    let ctx = context("PATCH", &meta, auth);

    let doc = run_blocking(&request_id, {
        let state = state.clone();
        move || state.gateway.update(&collection, &id, &patch, &ctx)
    })
    .await?;
    Ok(Json(document_to_json(&doc)))
}

/// `DELETE /api/collections/{collection}/{id}`: 204 on success.
pub async fn delete(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    OptionalAuth(auth): OptionalAuth,
    meta: RequestMeta,
) -> Result<StatusCode, ApiError> {
    let request_id = meta.request_id.clone();
    let ctx = context("DELETE", &meta, auth);

    run_blocking(&request_id, {
        let state = state.clone();
        move || state.gateway.delete(&collection, &id, &ctx)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn context(
    method: &str,
    meta: &RequestMeta,
    auth: Option<crate::auth::AccessClaims>,
) -> RequestContext {
    let mut ctx = RequestContext::anonymous(method, &meta.ip);
    ctx.auth = auth.map(|claims| claims.to_auth_json());
    ctx
}

fn render_expanded(doc: &ExpandedDocument) -> serde_json::Value {
    let mut json = document_to_json(&doc.document);
    if !doc.expand.is_empty() {
        let expand: serde_json::Map<String, serde_json::Value> = doc
            .expand
            .iter()
            .map(|(field, target)| (field.clone(), document_to_json(target)))
            .collect();
        json["expand"] = serde_json::Value::Object(expand);
    }
    json
}

/// Runs a gateway call on the blocking thread pool; rusqlite work must
/// not sit on an async worker.
async fn run_blocking<T: Send + 'static>(
    request_id: &str,
    f: impl FnOnce() -> Result<T, StoreError> + Send + 'static,
) -> Result<T, ApiError> {
    let request_id_owned = request_id.to_string();
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string(), &request_id_owned))?
        .map_err(|e| ApiError::from_store(e, &request_id_owned))
}

/// Parses the shared list-query parameters.
fn parse_list_params(
    state: &AppState,
    collection: &str,
    params: &[(String, String)],
    request_id: &str,
) -> Result<ListQuery, ApiError> {
    let snap = state.registry.load();
    let definition = snap.schema.collection(collection).ok_or_else(|| {
        ApiError::new(
            ErrorCode::NotFound,
            format!("unknown collection '{collection}'"),
            request_id,
        )
    })?;

    let mut query = ListQuery::default();
    for (key, value) in params {
        match key.as_str() {
            "limit" => {
                query.limit = Some(value.parse().map_err(|_| {
                    bad_param(request_id, "limit", "must be a non-negative integer")
                })?);
            }
            "offset" => {
                query.offset = Some(value.parse().map_err(|_| {
                    bad_param(request_id, "offset", "must be a non-negative integer")
                })?);
            }
            "sort" => {
                query.sort = Some(Sort::parse(value).ok_or_else(|| {
                    bad_param(request_id, "sort", "must be a field name, '-' for descending")
                })?);
            }
            "search" => {
                query.search = Some(value.clone());
            }
            "expand" => {
                query
                    .expand
                    .extend(value.split(',').map(|s| s.trim().to_string()));
            }
            "filter" => {
                query.filters.push(parse_filter_param(
                    definition,
                    value,
                    request_id,
                )?);
            }
            _ => {}
        }
    }
    Ok(query)
}

/// One `field:op:value` filter expression.
fn parse_filter_param(
    definition: &alyx_core::types::Collection,
    raw: &str,
    request_id: &str,
) -> Result<Filter, ApiError> {
    let mut parts = raw.splitn(3, ':');
    let (Some(field), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(bad_param(request_id, "filter", "must be 'field:op:value'"));
    };

    let field_def = definition.field(field).ok_or_else(|| {
        bad_param(request_id, "filter", &format!("unknown field '{field}'"))
    })?;
    let op = FilterOp::parse(op)
        .ok_or_else(|| bad_param(request_id, "filter", &format!("unknown operator '{op}'")))?;

    if op == FilterOp::In {
        let values: Result<Vec<Value>, ApiError> = value
            .split(',')
            .map(|item| typed_value(field_def.field_type, item.trim(), field, request_id))
            .collect();
        return Ok(Filter::in_set(field, values?));
    }

    let typed = typed_value(field_def.field_type, value, field, request_id)?;
    Ok(Filter::new(field, op, typed))
}

/// Coerces a filter's string value using the field's declared type.
fn typed_value(
    ty: FieldType,
    raw: &str,
    field: &str,
    request_id: &str,
) -> Result<Value, ApiError> {
    let json = match ty {
        FieldType::Int => raw
            .parse::<i64>()
            .map(serde_json::Value::from)
            .map_err(|_| bad_param(request_id, "filter", &format!("'{field}' takes an integer")))?,
        FieldType::Float => raw
            .parse::<f64>()
            .map(serde_json::Value::from)
            .map_err(|_| bad_param(request_id, "filter", &format!("'{field}' takes a number")))?,
        FieldType::Bool => match raw {
            "true" => serde_json::Value::Bool(true),
            "false" => serde_json::Value::Bool(false),
            _ => {
                return Err(bad_param(
                    request_id,
                    "filter",
                    &format!("'{field}' takes true or false"),
                ))
            }
        },
        _ => serde_json::Value::String(raw.to_string()),
    };
    Value::from_json(&json, ty).ok_or_else(|| {
        bad_param(request_id, "filter", &format!("bad value for '{field}'"))
    })
}

fn bad_param(request_id: &str, param: &str, reason: &str) -> ApiError {
    ApiError::new(
        ErrorCode::BadRequest,
        format!("query parameter '{param}': {reason}"),
        request_id,
    )
}
