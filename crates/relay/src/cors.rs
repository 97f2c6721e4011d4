// CORS for the read-only introspection endpoints.
//
// Origins come from `CANVASYNC_CORS_ORIGINS` (comma-separated, or `*`).
// Unset means local dashboard origins only.

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Origins allowed when no list is configured.
const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

/// Build a [`CorsLayer`] for the configured origin list.
///
/// - `"*"` allows any origin.
/// - A comma-separated list allows exactly those origins.
/// - `None` allows the default development origins.
///
/// Only `GET` and preflight `OPTIONS` are allowed, `x-request-id` is
/// exposed to the browser and preflight responses are cached for an hour.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([HeaderName::from_static("x-request-id")])
        .expose_headers([HeaderName::from_static("x-request-id")])
        .max_age(std::time::Duration::from_secs(3600));

    match origins {
        Some("*") => base.allow_origin(AllowOrigin::any()),
        Some(origins) => base.allow_origin(parse_origins(origins)),
        None => base.allow_origin(parse_origins(&DEFAULT_DEV_ORIGINS.join(","))),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, response::IntoResponse, routing::get, Router};
    use tower::ServiceExt;

    async fn ok_handler() -> impl IntoResponse {
        "ok"
    }

    fn test_app(origins: Option<&str>) -> Router {
        Router::new().route("/v1/status", get(ok_handler)).layer(cors_layer(origins))
    }

    fn preflight(origin: &str, method: &str) -> Request<Body> {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/v1/status")
            .header("origin", origin)
            .header("access-control-request-method", method)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn preflight_returns_cors_headers_for_allowed_origin() {
        let response = test_app(None).oneshot(preflight("http://localhost:5173", "GET")).await.unwrap();

        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:5173"
        );
        assert_eq!(response.headers().get("access-control-max-age").unwrap(), "3600");
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }

    #[tokio::test]
    async fn preflight_rejects_unknown_origin() {
        let response =
            test_app(None).oneshot(preflight("https://evil.example.com", "GET")).await.unwrap();

        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn write_methods_are_not_advertised() {
        let response = test_app(None).oneshot(preflight("http://localhost:3000", "POST")).await.unwrap();
        let allowed = response
            .headers()
            .get("access-control-allow-methods")
            .map(|value| value.to_str().unwrap().to_string())
            .unwrap_or_default();

        assert!(allowed.contains("GET"));
        assert!(!allowed.contains("POST"));
    }

    #[tokio::test]
    async fn configured_origins_replace_defaults() {
        let app = test_app(Some("https://board.example.com, https://staging.example.com"));

        let response = app
            .clone()
            .oneshot(preflight("https://board.example.com", "GET"))
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://board.example.com"
        );

        let response = app.oneshot(preflight("http://localhost:3000", "GET")).await.unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_allows_any_origin() {
        let response = test_app(Some("*"))
            .oneshot(preflight("https://anything.example.com", "GET"))
            .await
            .unwrap();

        assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "*");
    }

    #[test]
    fn parse_origins_handles_whitespace() {
        let origins = parse_origins("  https://a.com , https://b.com  , ");
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0], "https://a.com");
        assert_eq!(origins[1], "https://b.com");
    }
}
