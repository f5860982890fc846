//! Read-only JSON query surface over the record store.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use gcf_core::RecordQuery;
use gcf_storage::{RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "gcf-web";

#[derive(Clone)]
pub struct AppState {
    pub store: RecordStore,
}

impl AppState {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ListParams {
    keyword: Option<String>,
    #[serde(alias = "naics")]
    classification_code: Option<String>,
    limit: Option<u32>,
}

impl From<ListParams> for RecordQuery {
    fn from(params: ListParams) -> Self {
        RecordQuery {
            keyword: params.keyword,
            classification_code: params.classification_code,
            limit: params.limit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Listing<T> {
    pub count: usize,
    pub records: Vec<T>,
}

impl<T> From<Vec<T>> for Listing<T> {
    fn from(records: Vec<T>) -> Self {
        Self {
            count: records.len(),
            records,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(home_handler))
        .route("/api/opportunities", get(opportunities_handler))
        .route("/api/awards", get(awards_handler))
        .with_state(Arc::new(state))
}

pub async fn serve<F>(store: RecordStore, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "query surface listening");
    axum::serve(listener, app(AppState::new(store)))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

type ListQuery = Result<Query<ListParams>, QueryRejection>;

async fn home_handler(State(state): State<Arc<AppState>>, params: ListQuery) -> Response {
    let query = match params {
        Ok(Query(params)) => RecordQuery::from(params),
        Err(rejection) => return bad_request(rejection),
    };
    let opportunities = match state.store.query_opportunities(&query).await {
        Ok(rows) => rows,
        Err(err) => return store_error(err),
    };
    match state.store.query_awards(&query).await {
        Ok(awards) => Json(serde_json::json!({
            "opportunities": Listing::from(opportunities),
            "awards": Listing::from(awards),
        }))
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn opportunities_handler(State(state): State<Arc<AppState>>, params: ListQuery) -> Response {
    let query = match params {
        Ok(Query(params)) => RecordQuery::from(params),
        Err(rejection) => return bad_request(rejection),
    };
    match state.store.query_opportunities(&query).await {
        Ok(rows) => Json(Listing::from(rows)).into_response(),
        Err(err) => store_error(err),
    }
}

async fn awards_handler(State(state): State<Arc<AppState>>, params: ListQuery) -> Response {
    let query = match params {
        Ok(Query(params)) => RecordQuery::from(params),
        Err(rejection) => return bad_request(rejection),
    };
    match state.store.query_awards(&query).await {
        Ok(rows) => Json(Listing::from(rows)).into_response(),
        Err(err) => store_error(err),
    }
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn bad_request(rejection: QueryRejection) -> Response {
    json_error(StatusCode::BAD_REQUEST, rejection.body_text())
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "query failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
