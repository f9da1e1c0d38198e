//! ClientMind Gateway: JSON endpoints over the draft pipeline.
//!
//! `clientmind-gateway --init` creates the indices and ingest pipeline, then exits.

mod api;
mod handlers;

use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use clientmind_core::{ClientMindConfig, Services};
use handlers::{draft, persona, retrieval, status};
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Room for multipart boundaries and the small form fields next to the file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[clientmind-gateway] .env not loaded: {} (using system environment)", e);
    }

    let config = match ClientMindConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[clientmind-gateway] invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let default_filter = if config.debug_logs { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let services = match Services::from_config(config) {
        Ok(s) => s,
        Err(e) => {
            error!("document store unavailable: {}", e);
            std::process::exit(1);
        }
    };

    if std::env::args().any(|a| a == "--init") {
        match services.store.ensure_schema().await {
            Ok(()) => {
                info!("schema ready on {} store", services.store.backend());
                std::process::exit(0);
            }
            Err(e) => {
                error!("schema initialization failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let addr = services.config.bind_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!(
        "{} gateway listening on {} (store: {}, model: {:?})",
        services.config.app_name,
        addr,
        services.store.backend(),
        services.config.model_provider
    );

    if let Err(e) = axum::serve(listener, build_app(services)).await {
        error!("server error: {}", e);
    }
}

fn build_app(services: Services) -> Router {
    let upload_limit = services.config.max_upload_bytes + MULTIPART_OVERHEAD;
    Router::new()
        .route("/health", get(status::health))
        .route("/draft/generate", post(draft::generate))
        .route("/draft/approve", post(draft::approve))
        .route("/draft/hold", post(draft::hold))
        .route("/draft/reject", post(draft::reject))
        .route("/rag/dual", post(retrieval::rag_dual))
        .route("/knowledge/search", post(retrieval::knowledge_search))
        .route(
            "/knowledge/upload",
            post(retrieval::knowledge_upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/persona/get", post(persona::get))
        .route("/persona/upsert", post(persona::upsert))
        .route("/events/list", post(status::events_list))
        .route("/elastic/status", post(status::elastic_status))
        .with_state(services)
        .layer(middleware::from_fn(log_requests))
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        "{} {} -> {} ({} ms)",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use clientmind_core::context::MISSING_EMAIL_WARNING;
    use clientmind_core::generator::{ByteStream, ModelError, Prompt};
    use clientmind_core::lifecycle::{CallbackError, CallbackPayload};
    use clientmind_core::store::{
        ClusterHealth, IndexResult, SearchHit, SearchRequest, StoreResult, StoredDocument,
    };
    use clientmind_core::{CallbackSink, ConverseModel, DocumentStore, LocalStore, StoreError};
    use futures_util::StreamExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    const COMPLETE_FRAME: &str = r#"event: message_complete
data: {"data":{"message_content":"{\"draft_html\":\"<p>Thanks for writing</p>\",\"new_memories\":[{\"label\":\"Prefers email\",\"type\":\"basic\"}]}"}}

"#;

    struct ScriptedModel;

    #[async_trait]
    impl ConverseModel for ScriptedModel {
        async fn converse(&self, _prompt: &Prompt) -> Result<ByteStream, ModelError> {
            let chunks = vec![Ok(COMPLETE_FRAME.as_bytes().to_vec())];
            Ok(futures_util::stream::iter(chunks).boxed())
        }

        fn agent_id(&self) -> &str {
            "agent-test"
        }
    }

    struct AcceptingSink;

    #[async_trait]
    impl CallbackSink for AcceptingSink {
        async fn notify(&self, _url: &str, _payload: &CallbackPayload) -> Result<(), CallbackError> {
            Ok(())
        }
    }

    fn test_app() -> Router {
        let store = Arc::new(LocalStore::temporary().unwrap());
        build_app(Services::build(
            ClientMindConfig::default(),
            store,
            Arc::new(ScriptedModel),
            Arc::new(AcceptingSink),
        ))
    }

    /// A cluster that answers every call with 503.
    struct DownStore;

    fn unavailable() -> StoreError {
        StoreError::Status {
            status: 503,
            body: "cluster down".into(),
        }
    }

    #[async_trait]
    impl DocumentStore for DownStore {
        async fn get(&self, _index: &str, _id: &str) -> StoreResult<Option<StoredDocument>> {
            Err(unavailable())
        }

        async fn index(
            &self,
            _index: &str,
            _id: Option<&str>,
            _document: Value,
            _pipeline: Option<&str>,
        ) -> StoreResult<IndexResult> {
            Err(unavailable())
        }

        async fn update(&self, _index: &str, _id: &str, _partial: Value) -> StoreResult<IndexResult> {
            Err(unavailable())
        }

        async fn search(&self, _request: &SearchRequest) -> StoreResult<Vec<SearchHit>> {
            Err(unavailable())
        }

        async fn count(&self, _index: &str) -> StoreResult<u64> {
            Err(unavailable())
        }

        async fn health(&self) -> StoreResult<ClusterHealth> {
            Err(unavailable())
        }

        fn backend(&self) -> &'static str {
            "down"
        }
    }

    fn down_app() -> Router {
        build_app(Services::build(
            ClientMindConfig::default(),
            Arc::new(DownStore),
            Arc::new(ScriptedModel),
            Arc::new(AcceptingSink),
        ))
    }

    async fn read_json(res: Response) -> Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        (status, read_json(res).await)
    }

    fn inbound() -> Value {
        json!({
            "email_id": "m-100",
            "subject": "Order status",
            "body": "Where is my parcel?",
            "from": "VIP@Shop.test"
        })
    }

    #[tokio::test]
    async fn test_health_is_plain_ok() {
        let req = HttpRequest::builder().uri("/health").body(Body::empty()).unwrap();
        let res = test_app().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    async fn test_dual_without_email_warns() {
        let app = test_app();
        let (status, json) =
            post_json(&app, "/rag/dual", json!({"query_text": "return policy"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["code"], 0);
        assert_eq!(json["message"], "ok");
        assert_eq!(json["data"]["warnings"][0], MISSING_EMAIL_WARNING);
        assert_eq!(json["data"]["knowledge"]["hits"], json!([]));
        assert_eq!(json["data"]["memory"]["tags"], json!([]));
    }

    #[tokio::test]
    async fn test_dual_without_query_is_bad_request() {
        let app = test_app();
        let (status, json) = post_json(&app, "/rag/dual", json!({"customer_email": "a@b.c"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], -1);
        assert_eq!(json["message"], "query_text is required");
        assert!(json.get("data").is_none());
    }

    #[tokio::test]
    async fn test_malformed_json_uses_envelope() {
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/persona/upsert")
            .header("content-type", "application/json")
            .body(Body::from("{\"customer_email\": "))
            .unwrap();
        let res = test_app().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let json = read_json(res).await;
        assert_eq!(json["code"], -1);
        assert!(json["message"].as_str().unwrap().starts_with("invalid request body"));
    }

    #[tokio::test]
    async fn test_persona_upsert_then_get() {
        let app = test_app();
        let (status, json) = post_json(
            &app,
            "/persona/upsert",
            json!({
                "customer_email": "Ana@Shop.test",
                "tags": [{"label": "Late delivery", "type": "warning"}],
                "persona_config": {"agent_name": "Ava", "tone": "professional"}
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["updated"], true);
        assert_eq!(json["data"]["persona_config"]["agent_name"], "Ava");
        assert!(json["data"]["version"].as_u64().is_some());

        let (status, json) =
            post_json(&app, "/persona/get", json!({"customer_email": "ana@shop.test"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["tags"][0]["label"], "Late delivery");
        assert_eq!(json["data"]["tags"][0]["type"], "warning");
        assert_eq!(json["data"]["persona_config"]["tone"], "professional");
        assert!(json["data"]["correlation_id"].is_string());
    }

    #[tokio::test]
    async fn test_persona_get_requires_email() {
        let app = test_app();
        let (status, json) = post_json(&app, "/persona/get", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], -1);
    }

    #[tokio::test]
    async fn test_generate_assembles_context_then_approve_shows_in_feed() {
        let app = test_app();
        post_json(
            &app,
            "/persona/upsert",
            json!({"customer_email": "vip@shop.test", "tags": [{"label": "VIP", "type": "opportunity"}]}),
        )
        .await;

        let (status, json) = post_json(&app, "/draft/generate", json!({"email": inbound()})).await;
        assert_eq!(status, StatusCode::OK);
        let data = &json["data"];
        assert_eq!(data["draft"], "<p>Thanks for writing</p>");
        assert_eq!(
            data["reasoning"],
            "agent:agent-test | tone:friendly | tags:1 | history:0 | hits:0"
        );
        assert_eq!(data["new_memories"][0]["label"], "Prefers email");
        let draft_id = data["draft_id"].as_str().unwrap().to_string();

        let (status, json) = post_json(
            &app,
            "/draft/approve",
            json!({"draft_id": draft_id, "approved_by": "agent@shop.test"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["sent"], true);
        assert!(json["data"]["message_id"].is_string());

        let req = HttpRequest::builder()
            .method("POST")
            .uri("/events/list")
            .body(Body::empty())
            .unwrap();
        let json = read_json(app.clone().oneshot(req).await.unwrap()).await;
        let events = json["data"]["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["draft_id"], draft_id.as_str());
        assert_eq!(events[0]["status"], "approved");
        assert_eq!(events[0]["approved_by"], "agent@shop.test");
        assert_eq!(events[0]["customer_email"], "vip@shop.test");

        let (status, json) = post_json(
            &app,
            "/draft/hold",
            json!({"draft_id": draft_id, "n8n_callback_url": "http://n8n.test/resume"}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], -1);
    }

    #[tokio::test]
    async fn test_generate_rejects_incomplete_email() {
        let app = test_app();
        let (status, json) = post_json(
            &app,
            "/draft/generate",
            json!({"email": {"email_id": "m-1", "subject": "Hi"}}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], -1);
    }

    #[tokio::test]
    async fn test_hold_unknown_draft_is_not_found() {
        let app = test_app();
        let (status, json) = post_json(
            &app,
            "/draft/hold",
            json!({"draft_id": "nope", "n8n_callback_url": "http://n8n.test/resume"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], -1);
    }

    #[tokio::test]
    async fn test_reject_records_decision() {
        let app = test_app();
        let (status, json) = post_json(
            &app,
            "/draft/reject",
            json!({"draft_id": "d-77", "rejected_by": "lead@shop.test", "reason": "off tone"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["rejected"], true);
        assert_eq!(json["data"]["steps"][0]["step"], "draft_update");
        assert_eq!(json["data"]["steps"][0]["outcome"]["status"], "degraded");
    }

    #[tokio::test]
    async fn test_upload_rejects_non_pdf() {
        let body = concat!(
            "--XBOUNDARY\r\n",
            "Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n",
            "Content-Type: text/plain\r\n\r\n",
            "hello\r\n",
            "--XBOUNDARY--\r\n"
        );
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/knowledge/upload")
            .header("content-type", "multipart/form-data; boundary=XBOUNDARY")
            .body(Body::from(body))
            .unwrap();
        let res = test_app().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let json = read_json(res).await;
        assert!(json["message"].as_str().unwrap().contains("only PDF"));
    }

    #[tokio::test]
    async fn test_upload_requires_file_field() {
        let body = concat!(
            "--XBOUNDARY\r\n",
            "Content-Disposition: form-data; name=\"uploaded_by\"\r\n\r\n",
            "ops@shop.test\r\n",
            "--XBOUNDARY--\r\n"
        );
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/knowledge/upload")
            .header("content-type", "multipart/form-data; boundary=XBOUNDARY")
            .body(Body::from(body))
            .unwrap();
        let res = test_app().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(res).await["message"], "file is required");
    }

    #[tokio::test]
    async fn test_store_status_counts_indices() {
        let app = test_app();
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/elastic/status")
            .body(Body::empty())
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = read_json(res).await;
        assert_eq!(json["data"]["backend"], "local");
        assert_eq!(json["data"]["indices"].as_object().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_knowledge_search_survives_store_outage() {
        let app = down_app();
        let (status, json) =
            post_json(&app, "/knowledge/search", json!({"query_text": "return policy"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["code"], 0);
        assert_eq!(json["data"]["hits"], json!([]));
        assert_eq!(json["data"]["warnings"], json!(["Knowledge search failed."]));

        let (status, _) = post_json(&app, "/knowledge/search", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_persona_get_survives_store_outage() {
        let app = down_app();
        let (status, json) =
            post_json(&app, "/persona/get", json!({"customer_email": "ana@shop.test"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["tags"], json!([]));
        assert_eq!(json["data"]["interaction_history"], json!([]));
        assert_eq!(json["data"]["warnings"], json!(["Persona lookup failed."]));

        let (status, _) = post_json(&app, "/persona/get", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
