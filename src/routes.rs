use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method},
    response::IntoResponse,
    routing::{any, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::auth::{AuthError, Authenticator};
use crate::crud::{self, Reply};
use crate::error::ApiError;
use crate::store::{CollectionStore, Resource};

pub struct AppState {
    pub store: Arc<dyn CollectionStore>,
    pub aggregator: Arc<Aggregator>,
    pub auth: Arc<Authenticator>,
    /// Reject resource writes without a valid bearer token
    pub require_token_for_writes: bool,
}

/// Build the full application: routes plus CORS, security headers and
/// request tracing.
pub fn router(state: Arc<AppState>, allowed_origins: &[String]) -> Router {
    let mut app = Router::new()
        .route("/rss", get(rss))
        .route("/auth/login", post(login))
        .route("/health", get(health));

    for resource in Resource::ALL {
        app = app.route(
            &format!("/{}", resource.slug()),
            any(
                move |State(state): State<Arc<AppState>>,
                      method: Method,
                      headers: HeaderMap,
                      body: Bytes| async move {
                    resource_request(&state, resource, method, None, &headers, body).await
                },
            ),
        );

        if !crud::allowed_methods(resource, true).is_empty() {
            app = app.route(
                &format!("/{}/:id", resource.slug()),
                any(
                    move |State(state): State<Arc<AppState>>,
                          Path(id): Path<String>,
                          method: Method,
                          headers: HeaderMap,
                          body: Bytes| async move {
                        resource_request(&state, resource, method, Some(&id), &headers, body)
                            .await
                    },
                ),
            );
        }
    }

    app.layer(cors_layer(allowed_origins))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

async fn resource_request(
    state: &AppState,
    resource: Resource,
    method: Method,
    id: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Reply, ApiError> {
    let member = id.is_some();
    if !crud::is_allowed(resource, &method, member) {
        return Err(ApiError::MethodNotAllowed);
    }

    let writes = method != Method::GET && method != Method::HEAD;
    if writes && state.require_token_for_writes {
        check_bearer(&state.auth, headers)?;
    }

    let body = if method == Method::POST || method == Method::PUT {
        parse_body(&body)?
    } else {
        Value::Null
    };

    crud::handle(state.store.as_ref(), resource, &method, id, body).await
}

fn check_bearer(auth: &Authenticator, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    auth.verify(token.trim()).map(|_| ()).map_err(|e| {
        warn!("Rejected bearer token: {}", e);
        ApiError::Unauthorized
    })
}

/// An empty body is `{}`; anything else must be valid JSON.
fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|_| ApiError::BadRequest("Invalid JSON body".to_string()))
}

// Route handlers
pub async fn rss(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let items = state
        .aggregator
        .aggregate()
        .await
        .map_err(|_| ApiError::Feed)?;
    Ok(Json(json!({ "items": items })))
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: LoginRequest = match parse_body(&body)? {
        Value::Object(fields) => serde_json::from_value(Value::Object(fields)).unwrap_or_default(),
        _ => LoginRequest::default(),
    };

    match state.auth.login(&request.username, &request.password) {
        Ok(token) => {
            info!("Admin '{}' logged in", request.username);
            Ok(Json(json!({ "token": token })))
        }
        Err(AuthError::NotConfigured) => {
            warn!("Login attempted but admin credentials are not configured");
            Err(ApiError::Unauthorized)
        }
        Err(_) => {
            warn!("Failed login attempt for '{}'", request.username);
            Err(ApiError::Unauthorized)
        }
    }
}

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdminConfig;
    use crate::store::MemoryStore;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const ORIGIN: &str = "https://site.example";

    fn admin() -> AdminConfig {
        AdminConfig {
            username: Some("admin".into()),
            password: Some("s3cret".into()),
            jwt_secret: Some("signing-key".into()),
        }
    }

    fn create_test_app_with(store: MemoryStore, require_token_for_writes: bool) -> Router {
        let state = Arc::new(AppState {
            store: Arc::new(store),
            aggregator: Arc::new(Aggregator::new(Vec::new()).unwrap()),
            auth: Arc::new(Authenticator::new(&admin())),
            require_token_for_writes,
        });
        router(state, &[ORIGIN.to_string()])
    }

    fn create_test_app() -> Router {
        create_test_app_with(MemoryStore::new(), false)
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, headers, json)
    }

    mod health_tests {
        use super::*;

        #[tokio::test]
        async fn test_health_endpoint() {
            let app = create_test_app();

            let (status, _, body) = send(&app, request("GET", "/health", None)).await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "ok");
            let timestamp = body["timestamp"].as_str().unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
        }

        #[tokio::test]
        async fn test_security_headers_present() {
            let app = create_test_app();

            let (_, headers, _) = send(&app, request("GET", "/health", None)).await;

            assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
            assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
            assert!(headers[header::STRICT_TRANSPORT_SECURITY]
                .to_str()
                .unwrap()
                .starts_with("max-age="));
        }

        #[tokio::test]
        async fn test_security_headers_on_errors() {
            let app = create_test_app();

            let (status, headers, _) = send(&app, request("DELETE", "/articles", None)).await;

            assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        }
    }

    mod cors_tests {
        use super::*;

        #[tokio::test]
        async fn test_allowed_origin_echoed() {
            let app = create_test_app();
            let req = Request::builder()
                .uri("/health")
                .header(header::ORIGIN, ORIGIN)
                .body(Body::empty())
                .unwrap();

            let (_, headers, _) = send(&app, req).await;

            assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN);
        }

        #[tokio::test]
        async fn test_unknown_origin_not_echoed() {
            let app = create_test_app();
            let req = Request::builder()
                .uri("/health")
                .header(header::ORIGIN, "https://evil.example")
                .body(Body::empty())
                .unwrap();

            let (_, headers, _) = send(&app, req).await;

            assert!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        }

        #[tokio::test]
        async fn test_preflight() {
            let app = create_test_app();
            let req = Request::builder()
                .method("OPTIONS")
                .uri("/services/0")
                .header(header::ORIGIN, ORIGIN)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PUT")
                .body(Body::empty())
                .unwrap();

            let (status, headers, _) = send(&app, req).await;

            assert!(status.is_success());
            assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN);
            assert!(headers[header::ACCESS_CONTROL_ALLOW_METHODS]
                .to_str()
                .unwrap()
                .contains("PUT"));
        }
    }

    mod login_tests {
        use super::*;

        #[tokio::test]
        async fn test_login_success() {
            let app = create_test_app();

            let (status, _, body) = send(
                &app,
                request(
                    "POST",
                    "/auth/login",
                    Some(json!({"username": "admin", "password": "s3cret"})),
                ),
            )
            .await;

            assert_eq!(status, StatusCode::OK);
            let token = body["token"].as_str().unwrap();
            let claims = Authenticator::new(&admin()).verify(token).unwrap();
            assert_eq!(claims.username, "admin");
        }

        #[tokio::test]
        async fn test_login_wrong_password() {
            let app = create_test_app();

            let (status, _, body) = send(
                &app,
                request(
                    "POST",
                    "/auth/login",
                    Some(json!({"username": "admin", "password": "nope"})),
                ),
            )
            .await;

            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert!(body.get("token").is_none());
            assert_eq!(body["error"], "Invalid credentials");
        }

        #[tokio::test]
        async fn test_login_missing_fields() {
            let app = create_test_app();

            let (status, _, _) =
                send(&app, request("POST", "/auth/login", Some(json!({})))).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);

            let (status, _, _) = send(&app, request("POST", "/auth/login", None)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn test_login_malformed_json() {
            let app = create_test_app();
            let req = Request::builder()
                .method("POST")
                .uri("/auth/login")
                .body(Body::from("{username"))
                .unwrap();

            let (status, _, _) = send(&app, req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn test_login_get_is_405() {
            let app = create_test_app();
            let (status, _, _) = send(&app, request("GET", "/auth/login", None)).await;
            assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        }
    }

    mod rss_tests {
        use super::*;

        #[tokio::test]
        async fn test_rss_with_no_sources() {
            let app = create_test_app();

            let (status, _, body) = send(&app, request("GET", "/rss", None)).await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({"items": []}));
        }
    }

    mod resource_tests {
        use super::*;

        #[tokio::test]
        async fn test_post_then_get() {
            let app = create_test_app();
            let record = json!({"title": "Hello", "body": "World"});

            let (status, _, body) =
                send(&app, request("POST", "/articles", Some(record.clone()))).await;
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(body["message"], "Article created successfully");

            let (status, _, body) = send(&app, request("GET", "/articles", None)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!([record]));
        }

        #[tokio::test]
        async fn test_post_empty_body_stores_empty_object() {
            let app = create_test_app();

            let (status, _, _) = send(&app, request("POST", "/services", None)).await;
            assert_eq!(status, StatusCode::CREATED);

            let (_, _, body) = send(&app, request("GET", "/services", None)).await;
            assert_eq!(body, json!([{}]));
        }

        #[tokio::test]
        async fn test_post_invalid_json_is_400() {
            let app = create_test_app();
            let req = Request::builder()
                .method("POST")
                .uri("/services")
                .body(Body::from("not json"))
                .unwrap();

            let (status, _, body) = send(&app, req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], "Invalid JSON body");
        }

        #[tokio::test]
        async fn test_put_and_delete_services_by_index() {
            let store = MemoryStore::new().with_records(
                Resource::Services,
                vec![json!({"name": "A"}), json!({"name": "B"}), json!({"name": "C"})],
            );
            let app = create_test_app_with(store, false);

            let (status, _, body) = send(
                &app,
                request("PUT", "/services/1", Some(json!({"price": 10}))),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["message"], "Service updated successfully");

            let (status, _, body) = send(&app, request("DELETE", "/services/0", None)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["message"], "Service deleted successfully");

            let (_, _, body) = send(&app, request("GET", "/services", None)).await;
            assert_eq!(body, json!([{"name": "B", "price": 10}, {"name": "C"}]));
        }

        #[tokio::test]
        async fn test_feature_toggle_put_by_id() {
            let store = MemoryStore::new().with_records(
                Resource::FeatureToggles,
                vec![json!({"id": "promo", "enabled": false})],
            );
            let app = create_test_app_with(store, false);

            let (status, _, _) = send(
                &app,
                request("PUT", "/feature-toggles/promo", Some(json!({"enabled": true}))),
            )
            .await;
            assert_eq!(status, StatusCode::OK);

            let (_, _, body) = send(&app, request("GET", "/feature-toggles", None)).await;
            assert_eq!(body, json!([{"id": "promo", "enabled": true}]));
        }

        #[tokio::test]
        async fn test_method_matrix_enforced() {
            let app = create_test_app();

            for (method, uri) in [
                ("PUT", "/articles"),
                ("DELETE", "/articles"),
                ("PUT", "/rss-feeds/0"),
                ("POST", "/feature-toggles"),
                ("DELETE", "/feature-toggles/x"),
                ("PATCH", "/services/0"),
            ] {
                let (status, _, _) = send(&app, request(method, uri, Some(json!({})))).await;
                assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED, "{} {}", method, uri);
            }
        }

        #[tokio::test]
        async fn test_head_collection_like_get() {
            let app = create_test_app();

            for resource in Resource::ALL {
                let uri = format!("/{}", resource.slug());
                let (status, headers, body) = send(&app, request("HEAD", &uri, None)).await;
                assert_eq!(status, StatusCode::OK, "HEAD {}", uri);
                assert_eq!(headers[header::CONTENT_TYPE], "application/json");
                assert_eq!(body, Value::Null);
            }

            let (status, _, _) = send(&app, request("HEAD", "/health", None)).await;
            assert_eq!(status, StatusCode::OK);
            let (status, _, _) = send(&app, request("HEAD", "/services/0", None)).await;
            assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        }

        #[tokio::test]
        async fn test_articles_have_no_member_route() {
            let app = create_test_app();
            let (status, _, _) = send(&app, request("DELETE", "/articles/0", None)).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn test_storage_failure_is_500() {
            let store = MemoryStore::new();
            store.forget(Resource::SpecialOffers).await;
            let app = create_test_app_with(store, false);

            let (status, _, body) = send(&app, request("GET", "/special-offers", None)).await;

            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body["error"], "Failed to read special offers");
        }
    }

    mod write_guard_tests {
        use super::*;

        async fn token(app: &Router) -> String {
            let (_, _, body) = send(
                app,
                request(
                    "POST",
                    "/auth/login",
                    Some(json!({"username": "admin", "password": "s3cret"})),
                ),
            )
            .await;
            body["token"].as_str().unwrap().to_string()
        }

        #[tokio::test]
        async fn test_writes_open_by_default() {
            let app = create_test_app();
            let (status, _, _) =
                send(&app, request("POST", "/services", Some(json!({"a": 1})))).await;
            assert_eq!(status, StatusCode::CREATED);
        }

        #[tokio::test]
        async fn test_guard_rejects_missing_token() {
            let app = create_test_app_with(MemoryStore::new(), true);

            let (status, _, _) =
                send(&app, request("POST", "/services", Some(json!({"a": 1})))).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);

            let (_, _, body) = send(&app, request("GET", "/services", None)).await;
            assert_eq!(body, json!([]));
        }

        #[tokio::test]
        async fn test_guard_rejects_bad_token() {
            let app = create_test_app_with(MemoryStore::new(), true);
            let req = Request::builder()
                .method("POST")
                .uri("/services")
                .header(header::AUTHORIZATION, "Bearer not.a.token")
                .body(Body::from("{}"))
                .unwrap();

            let (status, _, _) = send(&app, req).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn test_guard_accepts_valid_token() {
            let app = create_test_app_with(MemoryStore::new(), true);
            let token = token(&app).await;
            let req = Request::builder()
                .method("POST")
                .uri("/services")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::from(r#"{"name": "Guarded"}"#))
                .unwrap();

            let (status, _, _) = send(&app, req).await;
            assert_eq!(status, StatusCode::CREATED);
        }

        #[tokio::test]
        async fn test_guard_leaves_reads_open() {
            let app = create_test_app_with(MemoryStore::new(), true);
            let (status, _, _) = send(&app, request("GET", "/feature-toggles", None)).await;
            assert_eq!(status, StatusCode::OK);
            let (status, _, _) = send(&app, request("HEAD", "/services", None)).await;
            assert_eq!(status, StatusCode::OK);
        }
    }
}
