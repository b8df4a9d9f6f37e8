//! HTTP surface.
//!
//! Every failure is reported as HTTP 200 with `{"Error": "<message>"}`;
//! clients must check the body, not the status. Only a wrong method gets a
//! non-200 status (405).

use crate::engine::{EngineError, EngineHandle};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use facerec_core::DynamicTemplateIndex;
use serde_json::json;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    engine: EngineHandle,
    index: DynamicTemplateIndex,
}

impl AppState {
    pub fn new(engine: EngineHandle, index: DynamicTemplateIndex) -> Self {
        Self { engine, index }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status).fallback(method_not_allowed))
        .route("/matching", post(matching).fallback(method_not_allowed))
        .route("/verification", post(verification).fallback(method_not_allowed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Failure text carried in the `Error` field.
#[derive(Debug)]
struct ApiError(String);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err.to_string())
    }
}

impl From<facerec_core::Error> for ApiError {
    fn from(err: facerec_core::Error) -> Self {
        ApiError(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        tracing::warn!(error = %self.0, "request failed");
        (StatusCode::OK, Json(json!({ "Error": self.0 }))).into_response()
    }
}

async fn method_not_allowed() -> impl IntoResponse {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(json!({
        "templateIndexSize": state.index.size()?,
        "templateIndexCapacity": state.index.capacity()?,
    })))
}

async fn matching(State(state): State<AppState>, body: Bytes) -> Result<Json<serde_json::Value>, ApiError> {
    let request = parse_body(&body);
    let image = decode_image(&request, "image")?;
    let result = state.engine.matching(image, state.index.clone()).await?;
    Ok(Json(result))
}

async fn verification(State(state): State<AppState>, body: Bytes) -> Result<Json<serde_json::Value>, ApiError> {
    let request = parse_body(&body);
    let image1 = decode_image(&request, "image1")?;
    let image2 = decode_image(&request, "image2")?;
    let result = state.engine.verify(image1, image2).await?;
    Ok(Json(result))
}

/// Malformed JSON reads as an empty body; the missing field is reported instead.
fn parse_body(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).unwrap_or(serde_json::Value::Null)
}

/// Base64-decoded bytes of the string field `key`.
fn decode_image(request: &serde_json::Value, key: &str) -> Result<Vec<u8>, ApiError> {
    let encoded = request
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError(format!("can't parse {key}")))?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ApiError(format!("illegal base64 data in {key}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::test_support::{engine, method, png};
    use axum_test::TestServer;
    use facerec_core::IndexConfig;

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    async fn server() -> (TestServer, DynamicTemplateIndex) {
        let handle = spawn_engine(engine()).unwrap();
        let index = DynamicTemplateIndex::create(IndexConfig::new(method(), 5)).unwrap();
        index.add(&handle.template(png(4, [255, 0, 0])).await.unwrap(), "red.png").unwrap();
        index.add(&handle.template(png(4, [0, 0, 255])).await.unwrap(), "blue.png").unwrap();
        let app = router(AppState::new(handle, index.clone()));
        (TestServer::new(app).unwrap(), index)
    }

    #[tokio::test]
    async fn test_status() {
        let (server, _) = server().await;
        let response = server.get("/").await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(
            response.json::<serde_json::Value>(),
            json!({"templateIndexSize": 2, "templateIndexCapacity": 5})
        );
    }

    #[tokio::test]
    async fn test_status_of_released_index() {
        let (server, index) = server().await;
        index.release().unwrap();
        let body = server.get("/").await.json::<serde_json::Value>();
        assert!(body["Error"].as_str().unwrap().contains("released"));
    }

    #[tokio::test]
    async fn test_matching() {
        let (server, _) = server().await;
        let response = server
            .post("/matching")
            .json(&json!({"image": b64(&png(4, [0, 10, 240]))}))
            .await;
        assert_eq!(response.status_code(), 200);
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["results"][0]["uuid"], "blue.png");
        assert!(body["results"][0]["score"].as_f64().unwrap() > 0.9);
    }

    #[tokio::test]
    async fn test_matching_errors_are_200_with_error_body() {
        let (server, _) = server().await;

        let missing = server.post("/matching").json(&json!({"picture": "x"})).await;
        assert_eq!(missing.status_code(), 200);
        assert_eq!(missing.json::<serde_json::Value>(), json!({"Error": "can't parse image"}));

        let not_json = server.post("/matching").text("{{").await;
        assert_eq!(not_json.json::<serde_json::Value>(), json!({"Error": "can't parse image"}));

        let two_faces = server
            .post("/matching")
            .json(&json!({"image": b64(&png(8, [0, 0, 255]))}))
            .await
            .json::<serde_json::Value>();
        assert!(two_faces["Error"].as_str().unwrap().starts_with("image must contain 1 face"));

        let bad_base64 = server.post("/matching").json(&json!({"image": "%%%"})).await;
        assert!(bad_base64.json::<serde_json::Value>()["Error"].is_string());
    }

    #[tokio::test]
    async fn test_verification() {
        let (server, _) = server().await;
        let body = server
            .post("/verification")
            .json(&json!({"image1": b64(&png(4, [9, 9, 9])), "image2": b64(&png(4, [50, 50, 50]))}))
            .await
            .json::<serde_json::Value>();
        assert_eq!(body["verdict"], true);
        assert!(body.get("score").is_some() && body.get("distance").is_some());
    }

    #[tokio::test]
    async fn test_verification_reports_first_missing_field() {
        let (server, _) = server().await;
        let body = server
            .post("/verification")
            .json(&json!({"image2": "abc"}))
            .await
            .json::<serde_json::Value>();
        assert_eq!(body, json!({"Error": "can't parse image1"}));

        let body = server
            .post("/verification")
            .json(&json!({"image1": b64(&png(4, [1, 1, 1]))}))
            .await
            .json::<serde_json::Value>();
        assert_eq!(body, json!({"Error": "can't parse image2"}));
    }

    #[tokio::test]
    async fn test_wrong_method() {
        let (server, _) = server().await;
        let response = server.get("/matching").await;
        assert_eq!(response.status_code(), 405);
        assert_eq!(response.text(), "Method not allowed");

        let response = server.post("/").await;
        assert_eq!(response.status_code(), 405);
    }
}
