use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use askama::Template;
use axum::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, FromRef, FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

use crate::clock::Clock;
use crate::config::Config;
use crate::controllers::paste::{self, NewPaste};
use crate::error::AppError;
use crate::models::PasteView;
use crate::storage::{self, PasteStore};
use crate::types::api::{CreatePaste, CreatedPaste, FetchedPaste, Health};
use crate::App;

/// The manual for the program in man page form.
const MAN_PAGE: &str = include_str!("../../assets/man.txt");

/// Header carrying a fake "now" in epoch milliseconds, honoured in test mode only.
const TEST_NOW_HEADER: &str = "x-test-now-ms";

pub async fn run(app: App) -> anyhow::Result<()> {
    let addr = SocketAddr::new(app.config.listen_address, app.config.port);

    if app.config.test_mode {
        warn!("test mode is on, clients can override the current time");
    }

    let router = router(app);

    info!("listening on {addr}");
    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}

pub fn router(app: App) -> Router {
    let max_upload_size = app.config.limits.max_upload_size;

    Router::new()
        .route("/", get(index))
        .route("/api/healthz", get(health))
        .route("/api/pastes", post(create_paste))
        .route("/api/pastes/:id", get(fetch_paste))
        .route("/p/:id", get(view_paste))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_size))
        .layer(cors())
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

/// Front ends hosted on other origins call the API directly.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::POST])
        .allow_headers(Any)
}

async fn index() -> &'static str {
    MAN_PAGE
}

async fn health(State(pastes): State<Option<PasteStore>>) -> Json<Health> {
    let result = match &pastes {
        Some(store) => store.health_check().await,
        None => Err(AppError::StoreNotConfigured),
    };

    match result {
        Ok(()) => Json(Health {
            ok: true,
            error: None,
        }),
        Err(e) => {
            warn!("health check failed: {e}");
            Json(Health {
                ok: false,
                error: Some(e.to_string()),
            })
        }
    }
}

async fn create_paste(
    State(config): State<Config>,
    State(pastes): State<Option<PasteStore>>,
    RequestTime(now): RequestTime,
    headers: HeaderMap,
    body: Result<Json<CreatePaste>, JsonRejection>,
) -> crate::AppResult<impl IntoResponse> {
    let store = storage::require(pastes.as_ref())?;
    let Json(body) = body.map_err(|rejection| AppError::validation("body", rejection.body_text()))?;
    let new = NewPaste::try_from(body)?;
    // resolve before writing so a failure doesn't leave an orphan behind
    let base_url = resolve_base_url(&headers, config.base_url.as_deref())?;

    let id = paste::create(store, new, now).await?;
    let path = format!("/p/{id}");
    let url = format!("{base_url}{path}");

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, path)],
        Json(CreatedPaste { id, url }),
    ))
}

async fn fetch_paste(
    State(pastes): State<Option<PasteStore>>,
    RequestTime(now): RequestTime,
    Path(id): Path<String>,
) -> crate::AppResult<Json<FetchedPaste>> {
    let store = storage::require(pastes.as_ref())?;
    let view = paste::retrieve(store, &id, now).await?;
    Ok(Json(view.into()))
}

async fn view_paste(
    State(pastes): State<Option<PasteStore>>,
    RequestTime(now): RequestTime,
    Path(id): Path<String>,
) -> Result<Html<String>, HtmlError> {
    let store = storage::require(pastes.as_ref())?;
    let view = paste::retrieve(store, &id, now).await?;
    let page = PastePage::new(&view).render().map_err(AppError::from)?;
    Ok(Html(page))
}

/// The time a request is evaluated at.
pub struct RequestTime(pub DateTime<Utc>);

#[async_trait]
impl<S> FromRequestParts<S> for RequestTime
where
    Config: FromRef<S>,
    Arc<dyn Clock>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = Config::from_ref(state);
        let clock = Arc::<dyn Clock>::from_ref(state);

        let overridden = config
            .test_mode
            .then(|| parts.headers.get(TEST_NOW_HEADER))
            .flatten()
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(RequestTime(overridden.unwrap_or_else(|| clock.now())))
    }
}

/// Work out the origin a shareable URL should point at: the request's own
/// `Origin`, then `Referer`, then `Host`, then the configured fallback.
pub fn resolve_base_url(headers: &HeaderMap, fallback: Option<&str>) -> crate::AppResult<String> {
    let header_str = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    };

    if let Some(origin) = header_str(header::ORIGIN).filter(|origin| *origin != "null") {
        return Ok(origin.trim_end_matches('/').to_owned());
    }

    let referer_origin = header_str(header::REFERER)
        .and_then(|referer| Url::parse(referer).ok())
        .map(|referer| referer.origin().ascii_serialization())
        .filter(|origin| origin != "null");
    if let Some(origin) = referer_origin {
        return Ok(origin);
    }

    if let Some(host) = header_str(header::HOST) {
        let scheme = header_str(header::HeaderName::from_static("x-forwarded-proto"))
            .and_then(|proto| proto.split(',').next())
            .map(str::trim)
            .filter(|proto| !proto.is_empty())
            .unwrap_or("http");
        return Ok(format!("{scheme}://{host}"));
    }

    fallback
        .map(|base_url| base_url.trim_end_matches('/'))
        .filter(|base_url| !base_url.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| {
            AppError::Configuration("no origin, referer or host header and no base_url".to_owned())
        })
}

#[derive(Template)]
#[template(path = "paste.html")]
struct PastePage<'a> {
    content: &'a str,
    info: Option<String>,
}

impl<'a> PastePage<'a> {
    fn new(view: &'a PasteView) -> Self {
        let mut info = Vec::new();
        if let Some(remaining) = view.remaining_views {
            info.push(format!("Views remaining: {remaining}"));
        }
        if let Some(expires_at) = view.expires_at {
            info.push(format!("Expires: {}", expires_at.format("%Y-%m-%d %H:%M:%S UTC")));
        }

        PastePage {
            content: &view.content,
            info: (!info.is_empty()).then(|| info.join(" | ")),
        }
    }
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorPage<'a> {
    title: &'a str,
    message: &'a str,
}

/// [`AppError`] rendered as an HTML page for browser routes.
struct HtmlError(AppError);

impl From<AppError> for HtmlError {
    fn from(value: AppError) -> Self {
        HtmlError(value)
    }
}

impl IntoResponse for HtmlError {
    fn into_response(self) -> Response {
        let HtmlError(error) = self;
        error.log();

        let status = error.status_code();
        let (title, message) = match status {
            StatusCode::NOT_FOUND => (
                "404 - Paste Not Found",
                "This paste does not exist or is no longer available.",
            ),
            StatusCode::SERVICE_UNAVAILABLE => (
                "503 - Service Unavailable",
                "Pastes can't be served right now. Try again later.",
            ),
            _ => ("500 - Something Went Wrong", "An unexpected error occurred."),
        };

        match (ErrorPage { title, message }).render() {
            Ok(page) => (status, Html(page)).into_response(),
            Err(_) => (status, error.public_message()).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::clock::FixedClock;
    use crate::config::{Limits, Storage};
    use crate::storage::file::FileStore;
    use crate::storage::memory::MemoryStore;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn config(test_mode: bool, base_url: Option<&str>) -> Config {
        Config {
            listen_address: [127, 0, 0, 1].into(),
            port: 0,
            base_url: base_url.map(str::to_owned),
            test_mode,
            storage: Storage {
                kind: None,
                ttl_grace_secs: 60,
                file: None,
                upstash: None,
            },
            limits: Limits {
                max_upload_size: 1024,
            },
        }
    }

    fn app_with(config: Config, pastes: Option<PasteStore>) -> Router {
        router(App {
            config,
            pastes,
            clock: Arc::new(FixedClock(now())),
        })
    }

    fn app() -> Router {
        app_with(
            config(false, None),
            Some(PasteStore::new(MemoryStore::default(), Duration::from_secs(60))),
        )
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, _, body) = send(router, request).await;
        (status, serde_json::from_str(&body).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_paste(body: Value) -> Request<Body> {
        Request::post("/api/pastes")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::HOST, "paste.test")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn create(router: &Router, body: Value) -> String {
        let (status, json) = send_json(router, post_paste(body)).await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        json["id"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn index_serves_manual() {
        let (status, _, body) = send(&app(), get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("/api/pastes"));
    }

    #[tokio::test]
    async fn health_ok() {
        let (status, json) = send_json(&app(), get("/api/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!({"ok": true}));
    }

    #[tokio::test]
    async fn health_reports_unconfigured_store_with_200() {
        let router = app_with(config(false, None), None);
        let (status, json) = send_json(&router, get("/api/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], json!(false));
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn health_reports_unreachable_store_with_200() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        std::fs::create_dir(&path).unwrap();
        let store = FileStore::new(&path).await.unwrap();
        let router = app_with(
            config(false, None),
            Some(PasteStore::new(store, Duration::from_secs(60))),
        );

        let (_, json) = send_json(&router, get("/api/healthz")).await;
        assert_eq!(json["ok"], json!(true));

        std::fs::remove_dir(&path).unwrap();
        let (status, json) = send_json(&router, get("/api/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], json!(false));
    }

    #[tokio::test]
    async fn unconfigured_store_is_503() {
        let router = app_with(config(false, None), None);

        let (status, _) = send_json(&router, post_paste(json!({"content": "hi"}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = send_json(&router, get("/api/pastes/abcdefghij")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _, body) = send(&router, get("/p/abcdefghij")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("Service Unavailable"));
    }

    #[tokio::test]
    async fn cors_preflight_for_create() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/pastes")
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();

        let (status, headers, _) = send(&app(), request).await;
        assert!(status.is_success(), "{status}");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(headers[header::ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap()
            .contains("POST"));
    }

    #[tokio::test]
    async fn cross_origin_create_is_allowed() {
        let request = Request::post("/api/pastes")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ORIGIN, "http://localhost:5173")
            .body(Body::from(r#"{"content":"hi"}"#))
            .unwrap();

        let (status, headers, body) = send(&app(), request).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let json: Value = serde_json::from_str(&body).unwrap();
        assert!(json["url"]
            .as_str()
            .unwrap()
            .starts_with("http://localhost:5173/p/"));
    }

    #[tokio::test]
    async fn store_outage_is_503() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        std::fs::create_dir(&path).unwrap();
        let store = FileStore::new(&path).await.unwrap();
        let router = app_with(
            config(false, None),
            Some(PasteStore::new(store, Duration::from_secs(60))),
        );
        let id = create(&router, json!({"content": "hi"})).await;

        std::fs::remove_dir_all(&path).unwrap();

        let (status, json) = send_json(&router, post_paste(json!({"content": "hi"}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json, json!({"error": "service temporarily unavailable"}));

        let (status, _) = send_json(&router, get(&format!("/api/pastes/{id}"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _, body) = send(&router, get(&format!("/p/{id}"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("Service Unavailable"));
    }

    #[tokio::test]
    async fn create_rejects_invalid_input() {
        let router = app();
        let cases = [
            (json!({"content": ""}), "content"),
            (json!({"content": "   "}), "content"),
            (json!({"content": "x", "ttl_seconds": 0}), "ttl_seconds"),
            (json!({"content": "x", "ttl_seconds": -1}), "ttl_seconds"),
            (json!({"content": "x", "ttl_seconds": 2.5}), "ttl_seconds"),
            (json!({"content": "x", "max_views": 0}), "max_views"),
            (json!({"content": "x", "max_views": "3"}), "max_views"),
        ];
        for (body, field) in cases {
            let (status, json) = send_json(&router, post_paste(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(json["error"].as_str().unwrap().contains(field), "{json}");
        }
    }

    #[tokio::test]
    async fn create_rejects_malformed_body() {
        let request = Request::post("/api/pastes")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::HOST, "paste.test")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, json) = send_json(&app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn create_without_any_origin_is_500() {
        let request = Request::post("/api/pastes")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"content":"hi"}"#))
            .unwrap();
        let (status, json) = send_json(&app(), request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json, json!({"error": "unable to determine base URL"}));
    }

    #[tokio::test]
    async fn create_falls_back_to_configured_base_url() {
        let router = app_with(
            config(false, Some("https://paste.example/")),
            Some(PasteStore::new(MemoryStore::default(), Duration::from_secs(60))),
        );
        let request = Request::post("/api/pastes")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"content":"hi"}"#))
            .unwrap();

        let (status, headers, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::CREATED);
        let json: Value = serde_json::from_str(&body).unwrap();
        let id = json["id"].as_str().unwrap();
        assert_eq!(json["url"], json!(format!("https://paste.example/p/{id}")));
        assert_eq!(headers[header::LOCATION], format!("/p/{id}"));
    }

    #[tokio::test]
    async fn round_trip_without_limits() {
        let router = app();
        let id = create(&router, json!({"content": "hello\nworld"})).await;

        let (status, json) = send_json(&router, get(&format!("/api/pastes/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json,
            json!({"content": "hello\nworld", "remaining_views": null, "expires_at": null})
        );
    }

    #[tokio::test]
    async fn view_limited_scenario() {
        let router = app();
        let (status, json) = send_json(
            &router,
            post_paste(json!({"content": "hello", "ttl_seconds": 300, "max_views": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = json["id"].as_str().unwrap().to_owned();
        assert_eq!(id.len(), 10);
        assert_eq!(json["url"], json!(format!("http://paste.test/p/{id}")));

        let uri = format!("/api/pastes/{id}");
        let (status, json) = send_json(&router, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["content"], json!("hello"));
        assert_eq!(json["remaining_views"], json!(1));
        assert_eq!(json["expires_at"], json!("2023-11-14T22:18:20.000Z"));

        let (status, json) = send_json(&router, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["remaining_views"], json!(0));

        let (status, json) = send_json(&router, get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json, json!({"error": "paste not found"}));
    }

    #[tokio::test]
    async fn html_view_escapes_content_and_counts_views() {
        let router = app();
        let id = create(
            &router,
            json!({"content": "<script>alert(1)</script> & co", "max_views": 2}),
        )
        .await;

        let (status, headers, body) = send(&router, get(&format!("/p/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        assert!(body.contains("&lt;script&gt;alert(1)"), "{body}");
        assert!(body.contains("&amp; co"));
        assert!(!body.contains("<script>"));
        assert!(body.contains("Views remaining: 1"));

        // the HTML view consumed a view too
        let (_, json) = send_json(&router, get(&format!("/api/pastes/{id}"))).await;
        assert_eq!(json["remaining_views"], json!(0));

        let (status, _, body) = send(&router, get(&format!("/p/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("Paste Not Found"));
    }

    #[tokio::test]
    async fn test_mode_header_moves_the_clock() {
        let router = app_with(
            config(true, None),
            Some(PasteStore::new(MemoryStore::default(), Duration::from_secs(60))),
        );
        let id = create(&router, json!({"content": "hi", "ttl_seconds": 10})).await;
        let uri = format!("/api/pastes/{id}");

        let at = |offset_secs: i64| {
            let ms = (now() + chrono::Duration::seconds(offset_secs)).timestamp_millis();
            Request::get(&uri)
                .header(TEST_NOW_HEADER, HeaderValue::from(ms))
                .body(Body::empty())
                .unwrap()
        };

        let (status, _) = send_json(&router, at(5)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send_json(&router, at(11)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mode_header_ignored_outside_test_mode() {
        let router = app();
        let id = create(&router, json!({"content": "hi", "ttl_seconds": 10})).await;

        let late = (now() + chrono::Duration::seconds(60)).timestamp_millis();
        let request = Request::get(format!("/api/pastes/{id}"))
            .header(TEST_NOW_HEADER, HeaderValue::from(late))
            .body(Body::empty())
            .unwrap();

        let (status, _) = send_json(&router, request).await;
        assert_eq!(status, StatusCode::OK);
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|&(name, value)| {
                (
                    header::HeaderName::from_static(name),
                    HeaderValue::from_static(value),
                )
            })
            .collect()
    }

    #[test]
    fn base_url_prefers_origin() {
        let h = headers(&[
            ("origin", "https://app.example"),
            ("referer", "https://other.example/page"),
            ("host", "internal:3001"),
        ]);
        assert_eq!(resolve_base_url(&h, None).unwrap(), "https://app.example");
    }

    #[test]
    fn base_url_from_referer_drops_path() {
        let h = headers(&[
            ("origin", "null"),
            ("referer", "http://localhost:5173/some/page?q=1"),
            ("host", "internal:3001"),
        ]);
        assert_eq!(resolve_base_url(&h, None).unwrap(), "http://localhost:5173");
    }

    #[test]
    fn base_url_from_host() {
        let h = headers(&[("host", "paste.example")]);
        assert_eq!(resolve_base_url(&h, None).unwrap(), "http://paste.example");

        let h = headers(&[("host", "paste.example"), ("x-forwarded-proto", "https")]);
        assert_eq!(resolve_base_url(&h, None).unwrap(), "https://paste.example");
    }

    #[test]
    fn base_url_falls_back_to_config() {
        let h = HeaderMap::new();
        assert_eq!(
            resolve_base_url(&h, Some("https://paste.example/")).unwrap(),
            "https://paste.example"
        );
        assert!(matches!(
            resolve_base_url(&h, None),
            Err(AppError::Configuration(_))
        ));
        assert!(matches!(
            resolve_base_url(&h, Some("")),
            Err(AppError::Configuration(_))
        ));
    }
}
