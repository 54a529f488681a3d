use crate::charts::bar_chart_svg;
use crate::config::AppConfig;
use crate::data::{read_occurrences, OccurrenceFormat};
use crate::layers::{canton_layer, cluster_layer, province_layer};
use crate::processing::{cluster_points, run, Analysis, RegionLayer};
use crate::render::Summary;
use crate::types::{GroupBy, OccurrenceSet, ProvinceArea, RecordRow};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use geo::Point;
use geojson::FeatureCollection;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

const INDEX_HTML: &str = include_str!("../static/index.html");

pub struct AppState {
    pub config: AppConfig,
    pub layer: RegionLayer,
    pub provinces: Vec<ProvinceArea>,
    pub occurrences: RwLock<Option<OccurrenceSet>>,
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(e) => {
                warn!("Request failed: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Deserialize)]
pub struct SpeciesParams {
    species: Option<String>,
}

#[derive(Deserialize)]
pub struct ClusterParams {
    species: Option<String>,
    zoom: u8,
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

#[derive(Serialize)]
pub struct UploadResponse {
    records: usize,
    dropped_without_species: usize,
    species: Vec<String>,
}

#[derive(Serialize)]
pub struct QueryResponse {
    code: i64,
    canton: String,
    province: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.server.max_upload_mb * 1024 * 1024;
    let output_dir = ServeDir::new(&state.config.output.dir);

    Router::new()
        .route("/", get(|| async { Html(INDEX_HTML) }))
        .route("/api/config", get(config_handler))
        .route("/api/occurrences", post(upload_handler).layer(DefaultBodyLimit::max(upload_limit)))
        .route("/api/species", get(species_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/records", get(records_handler))
        .route("/api/layers/{group}", get(layer_handler))
        .route("/api/charts/{group}", get(chart_handler))
        .route("/api/clusters", get(clusters_handler))
        .route("/api/query", get(query_handler))
        .nest_service("/output", output_dir)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(state: AppState) -> Result<()> {
    let port = state.config.server.port;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let app = router(Arc::new(state));

    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Runs the pipeline against the current upload on the blocking pool and hands
/// the result to `f`.
async fn with_analysis<T, F>(state: Arc<AppState>, species: Option<String>, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&AppState, &Analysis<'_>) -> ApiResult<T> + Send + 'static,
{
    blocking(move || {
        let guard = state.occurrences.blocking_read();
        let set = guard
            .as_ref()
            .ok_or_else(|| ApiError::NotFound("No occurrence file has been uploaded".into()))?;
        let analysis = run(set, &state.layer, species.as_deref())
            .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?;
        f(&state, &analysis)
    })
    .await
}

/// Parsing and the spatial join are CPU-bound and stay off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ApiResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("Worker task failed")))?
}

fn parse_group(group: &str) -> ApiResult<GroupBy> {
    match group {
        "canton" => Ok(GroupBy::Canton),
        "province" => Ok(GroupBy::Province),
        other => Err(ApiError::NotFound(format!("Unknown grouping '{}'", other))),
    }
}

async fn config_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let map = &state.config.map;
    Json(serde_json::json!({
        "center": map.center,
        "zoom": map.zoom,
        "min_zoom": state.config.output.min_zoom,
        "max_zoom": state.config.output.max_zoom,
        "fill_opacity": map.fill_opacity,
        "line_opacity": map.line_opacity,
    }))
}

async fn upload_handler(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Json<UploadResponse>> {
    let format = OccurrenceFormat::from_config(&state.config);
    let set = blocking(move || {
        read_occurrences(&body[..], &format).map_err(|e| ApiError::BadRequest(format!("{:#}", e)))
    })
    .await?;

    let response = UploadResponse {
        records: set.records.len(),
        dropped_without_species: set.dropped_without_species,
        species: set.species(),
    };
    info!("Accepted upload with {} records", response.records);
    *state.occurrences.write().await = Some(set);
    Ok(Json(response))
}

async fn species_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<String>>> {
    let guard = state.occurrences.read().await;
    match guard.as_ref() {
        Some(set) => Ok(Json(set.species())),
        None => Err(ApiError::NotFound("No occurrence file has been uploaded".into())),
    }
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SpeciesParams>,
) -> ApiResult<Json<Summary>> {
    with_analysis(state, params.species, |state, analysis| {
        Ok(Json(Summary::new(analysis, &state.layer)))
    })
    .await
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SpeciesParams>,
) -> ApiResult<Json<Vec<RecordRow>>> {
    with_analysis(state, params.species, |_, analysis| Ok(Json(analysis.rows()))).await
}

async fn layer_handler(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    Query(params): Query<SpeciesParams>,
) -> ApiResult<Json<FeatureCollection>> {
    let group = parse_group(&group)?;
    with_analysis(state, params.species, move |state, analysis| {
        let fc = match group {
            GroupBy::Canton => canton_layer(&state.layer, &analysis.counts, &state.config.map),
            GroupBy::Province => province_layer(&state.provinces, &state.layer, &analysis.counts, &state.config.map),
        };
        Ok(Json(fc))
    })
    .await
}

async fn chart_handler(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    Query(params): Query<SpeciesParams>,
) -> ApiResult<Response> {
    let group = parse_group(&group)?;
    with_analysis(state, params.species, move |state, analysis| {
        let rows = analysis.counts.charted(&state.layer, group);
        let svg = bar_chart_svg(&rows, group, &state.config.map.bar_color)?;
        Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response())
    })
    .await
}

async fn clusters_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ClusterParams>,
) -> ApiResult<Json<FeatureCollection>> {
    let zoom = params.zoom.min(22);
    with_analysis(state, params.species, move |_, analysis| {
        let clusters = cluster_points(&analysis.records, zoom);
        Ok(Json(cluster_layer(&clusters, zoom)))
    })
    .await
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<QueryResponse>> {
    let point = Point::new(params.lon, params.lat);
    Json(state.layer.locate(&point).map(|region| QueryResponse {
        code: region.code,
        canton: region.canton.clone(),
        province: region.province.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::{CANTONES, OCCURRENCES};
    use crate::data::read_geojson_regions;
    use crate::dissolve::dissolve_provinces;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        let config = AppConfig::from_toml("[input]\nboundaries = \"c.geojson\"").unwrap();
        let regions = read_geojson_regions(CANTONES.as_bytes(), &config.regions).unwrap();
        let layer = RegionLayer::new(regions).unwrap();
        let provinces = dissolve_provinces(&layer);
        Arc::new(AppState {
            config,
            layer,
            provinces,
            occurrences: RwLock::new(None),
        })
    }

    async fn call(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn get_json(state: &Arc<AppState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let (status, body) = call(state, Request::get(uri).body(Body::empty()).unwrap()).await;
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    async fn upload(state: &Arc<AppState>, data: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::post("/api/occurrences").body(Body::from(data.to_string())).unwrap();
        let (status, body) = call(state, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn queries_before_upload_are_not_found() {
        let state = state();
        let (status, _) = get_json(&state, "/api/species").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(&state, "/api/summary").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_then_summarise() {
        let state = state();
        let (status, body) = upload(&state, OCCURRENCES).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records"], 4);
        assert_eq!(body["dropped_without_species"], 1);
        assert_eq!(body["species"], serde_json::json!(["Ara macao", "Tapirus bairdii"]));

        let (status, summary) = get_json(&state, "/api/summary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["species"], "Ara macao");
        assert_eq!(summary["counted"], 2);
        assert_eq!(summary["without_geometry"], 1);

        let (_, summary) = get_json(&state, "/api/summary?species=Tapirus%20bairdii").await;
        assert_eq!(summary["by_canton"][0]["label"], "Puntarenas");
        assert_eq!(summary["by_canton"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bad_upload_and_unknown_species_are_rejected() {
        let state = state();
        let (status, body) = upload(&state, "species\tlocality\nAra macao\tOsa\n").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("gbifID"));

        upload(&state, OCCURRENCES).await;
        let (status, _) = get_json(&state, "/api/records?species=Panthera%20onca").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_queries_share_the_upload() {
        let state = state();
        upload(&state, OCCURRENCES).await;

        let requests = (0..8).map(|n| {
            let state = state.clone();
            let uri = if n % 2 == 0 { "/api/summary" } else { "/api/layers/province" };
            tokio::spawn(async move { get_json(&state, uri).await.0 })
        });
        for handle in requests.collect::<Vec<_>>() {
            assert_eq!(handle.await.unwrap(), StatusCode::OK);
        }

        // A replacement upload is visible to the next query
        let (status, _) = upload(&state, "gbifID\tspecies\tdecimalLatitude\tdecimalLongitude\tstateProvince\tlocality\teventDate\n9\tPanthera onca\t0.5\t0.5\t\t\t\n").await;
        assert_eq!(status, StatusCode::OK);
        let (_, summary) = get_json(&state, "/api/summary").await;
        assert_eq!(summary["species"], "Panthera onca");
        assert_eq!(summary["counted"], 1);
    }

    #[tokio::test]
    async fn layers_records_and_charts() {
        let state = state();
        upload(&state, OCCURRENCES).await;

        let (status, cantons) = get_json(&state, "/api/layers/canton").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cantons["features"].as_array().unwrap().len(), 3);

        let (_, provinces) = get_json(&state, "/api/layers/province").await;
        assert_eq!(provinces["features"].as_array().unwrap().len(), 2);

        let (status, _) = get_json(&state, "/api/layers/district").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, records) = get_json(&state, "/api/records").await;
        assert_eq!(records.as_array().unwrap().len(), 3);
        assert_eq!(records[0]["date"], "2019-03-15 10:30:00");

        let (_, clusters) = get_json(&state, "/api/clusters?zoom=4").await;
        assert_eq!(clusters["features"].as_array().unwrap().len(), 1);

        let (status, svg) = call(&state, Request::get("/api/charts/province").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(svg).unwrap().contains("San José"));
    }

    #[tokio::test]
    async fn index_page_escapes_record_fields() {
        let state = state();
        let (status, body) = call(&state, Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let page = String::from_utf8(body).unwrap();
        assert!(page.contains("const esc = "));
        for raw in ["${r.species}", "${r.locality}", "${s}</option>", "${f.properties.species}", "f.properties.canton + "] {
            assert!(!page.contains(raw), "unescaped {}", raw);
        }
    }

    #[tokio::test]
    async fn point_query_finds_region() {
        let state = state();
        let (_, hit) = get_json(&state, "/api/query?lat=0.5&lon=1.5").await;
        assert_eq!(hit["code"], 102);
        assert_eq!(hit["canton"], "Escazú");

        let (_, miss) = get_json(&state, "/api/query?lat=40&lon=40").await;
        assert!(miss.is_null());
    }
}
