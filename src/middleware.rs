//! The curated middleware set and the essential stack attachment.

use crate::config::ServerConfig;
use crate::error::RouterError;
use crate::router::Router;
use async_trait::async_trait;
use axum::body::HttpBody;
use axum::extract::{ConnectInfo, FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::CompressionLevel;
use ulid::Ulid;

/// Response header carrying the request id.
pub const HEADER_REQUEST_ID: &str = "x-draken-request-id";
const HEADER_VERSION: &str = "x-draken-version";
const SERVER_NAME: &str = "draken";
const SERVER_VERSION: &str = "v1";

const GZIP_LEVEL: i32 = 5;

/// Per-request id, stored in the request extensions by [`request_id`] and
/// echoed in the `X-Draken-Request-Id` response header. Extractable in
/// handlers.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Effective client address: proxy headers first, socket peer otherwise.
#[derive(Clone, Debug)]
pub struct RealIp(pub String);

/// Sets the `Server` and `X-Draken-Version` banner headers.
pub async fn webserver_banner(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    headers.insert(HEADER_VERSION, HeaderValue::from_static(SERVER_VERSION));
    response
}

/// Generates a sortable id per request, stores it in the request extensions
/// and echoes it in the response header.
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = Ulid::new().to_string();
    req.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(HEADER_REQUEST_ID, value);
    }
    response
}

/// Resolves the effective remote address into a [`RealIp`] extension:
/// `X-Real-IP`, then the first `X-Forwarded-For` entry, then the socket peer.
pub async fn real_ip(mut req: Request, next: Next) -> Response {
    let resolved = header_value(&req, "x-real-ip")
        .or_else(|| {
            header_value(&req, "x-forwarded-for")
                .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        })
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|peer| peer.0.to_string())
        })
        .unwrap_or_default();
    req.extensions_mut().insert(RealIp(resolved));
    next.run(req).await
}

fn header_value(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

/// Emits one info record per request after the downstream chain finished,
/// so status and byte count reflect what was actually sent.
pub async fn access_log(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let url = req.uri().to_string();
    let proto = format!("{:?}", req.version());
    let remote = header_value(&req, "x-real-ip")
        .or_else(|| req.extensions().get::<RealIp>().map(|ip| ip.0.clone()))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|peer| peer.0.to_string())
        })
        .unwrap_or_default();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let bytes = response.body().size_hint().exact().unwrap_or(0);
    let duration = start.elapsed();
    tracing::info!(
        method = %method,
        url = %url,
        proto = %proto,
        remote = %remote,
        status,
        bytes,
        duration_ms = duration.as_millis() as u64,
        request_id = %request_id,
        "{method} {url} {proto} from {remote} - {status} {bytes}B in {duration:?}"
    );
    response
}

/// Panic handler for the recovery layer: error log, 500 with an empty body.
pub fn recover_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "handler panicked");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

/// Security response headers. A field set to the empty string is omitted.
#[derive(Clone, Debug)]
pub struct SecurityHeaders {
    pub x_content_type_options: String,
    pub x_frame_options: String,
    pub x_xss_protection: String,
    pub referrer_policy: String,
    pub content_security_policy: String,
    pub cache_control: String,
    pub strict_transport_security: String,
}

impl Default for SecurityHeaders {
    /// The secure baseline.
    fn default() -> Self {
        SecurityHeaders {
            x_content_type_options: "nosniff".into(),
            x_frame_options: "DENY".into(),
            x_xss_protection: "1; mode=block".into(),
            referrer_policy: "no-referrer".into(),
            content_security_policy: "default-src 'self'".into(),
            cache_control: "no-store".into(),
            strict_transport_security: "max-age=63072000; includeSubDomains; preload".into(),
        }
    }
}

impl SecurityHeaders {
    async fn apply(self, req: Request, next: Next) -> Response {
        let mut response = next.run(req).await;
        let headers = response.headers_mut();
        for (name, value) in [
            ("x-content-type-options", &self.x_content_type_options),
            ("x-frame-options", &self.x_frame_options),
            ("x-xss-protection", &self.x_xss_protection),
            ("referrer-policy", &self.referrer_policy),
            ("content-security-policy", &self.content_security_policy),
            ("cache-control", &self.cache_control),
            (
                "strict-transport-security",
                &self.strict_transport_security,
            ),
        ] {
            if value.is_empty() {
                continue;
            }
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        }
        response
    }
}

/// Liveness handler.
pub async fn heartbeat() -> &'static str {
    "im alive"
}

/// Attach the curated stack to `router` in order: banner (unless hidden),
/// request-id, real-ip, access-logger, recoverer, security (if enabled),
/// heartbeat route (if enabled), gzip. Returns whether clean-path
/// normalisation should wrap the engine at serve time.
pub(crate) fn attach_essentials(
    router: &Router,
    server: &ServerConfig,
    security: SecurityHeaders,
) -> Result<bool, RouterError> {
    if !server.hidden {
        router.middleware(from_fn(webserver_banner))?;
    }
    router.middleware(from_fn(request_id))?;
    // Clean-path runs before routing and therefore wraps the engine itself;
    // the caller applies it at serve time.
    let clean_path = true;
    router.middleware(from_fn(real_ip))?;
    router.middleware(from_fn(access_log))?;
    router.middleware(CatchPanicLayer::custom(recover_panic))?;
    if server.security {
        router.middleware(from_fn(move |req: Request, next: Next| {
            security.clone().apply(req, next)
        }))?;
    }
    if server.heartbeat.enabled && !server.heartbeat.endpoint.is_empty() {
        router.get(&server.heartbeat.endpoint, heartbeat)?;
    }
    router.middleware(
        CompressionLayer::new().quality(CompressionLevel::Precise(GZIP_LEVEL)),
    )?;
    Ok(clean_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeartbeatConfig;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn hello() -> &'static str {
        "hello"
    }

    fn server_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            hidden: false,
            security: false,
            heartbeat: HeartbeatConfig::default(),
        }
    }

    fn essential_app(server: &ServerConfig) -> axum::Router {
        let router = Router::new();
        router.get("/hello", hello).unwrap();
        attach_essentials(&router, server, SecurityHeaders::default()).unwrap();
        router.freeze()
    }

    fn request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn banner_and_request_id_on_every_response() {
        let app = essential_app(&server_config());
        // Unrouted path still carries the headers.
        let response = app.oneshot(request("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get(header::SERVER).unwrap(), "draken");
        assert_eq!(response.headers().get("x-draken-version").unwrap(), "v1");
        assert!(response.headers().contains_key(HEADER_REQUEST_ID));
    }

    #[tokio::test]
    async fn hidden_server_omits_banner_but_keeps_request_id() {
        let mut server = server_config();
        server.hidden = true;
        let app = essential_app(&server);
        let response = app.oneshot(request("/hello")).await.unwrap();
        assert!(response.headers().get(header::SERVER).is_none());
        assert!(response.headers().get("x-draken-version").is_none());
        assert!(response.headers().contains_key(HEADER_REQUEST_ID));
    }

    #[tokio::test]
    async fn request_ids_are_distinct() {
        let app = essential_app(&server_config());
        let first = app.clone().oneshot(request("/hello")).await.unwrap();
        let second = app.oneshot(request("/hello")).await.unwrap();
        let a = first.headers().get(HEADER_REQUEST_ID).unwrap();
        let b = second.headers().get(HEADER_REQUEST_ID).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn request_id_header_matches_extension() {
        async fn echo_id(id: RequestId) -> String {
            id.0
        }
        let router = Router::new();
        router.get("/id", echo_id).unwrap();
        attach_essentials(&router, &server_config(), SecurityHeaders::default()).unwrap();
        let app = router.freeze();

        let response = app.oneshot(request("/id")).await.unwrap();
        let header = response
            .headers()
            .get(HEADER_REQUEST_ID)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(header.as_bytes(), &body[..]);
    }

    #[tokio::test]
    async fn heartbeat_route_answers() {
        let mut server = server_config();
        server.heartbeat = HeartbeatConfig {
            enabled: true,
            endpoint: "/healthz".into(),
        };
        let app = essential_app(&server);
        let response = app.oneshot(request("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"im alive");
    }

    #[tokio::test]
    async fn security_headers_use_the_documented_defaults() {
        let mut server = server_config();
        server.security = true;
        let app = essential_app(&server);
        let response = app.oneshot(request("/hello")).await.unwrap();
        let headers = response.headers();
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(headers.get("x-xss-protection").unwrap(), "1; mode=block");
        assert_eq!(headers.get("referrer-policy").unwrap(), "no-referrer");
        assert_eq!(
            headers.get("content-security-policy").unwrap(),
            "default-src 'self'"
        );
        assert_eq!(headers.get("cache-control").unwrap(), "no-store");
        assert_eq!(
            headers.get("strict-transport-security").unwrap(),
            "max-age=63072000; includeSubDomains; preload"
        );
    }

    #[tokio::test]
    async fn empty_security_field_omits_the_header() {
        let mut server = server_config();
        server.security = true;
        let router = Router::new();
        router.get("/hello", hello).unwrap();
        let security = SecurityHeaders {
            x_frame_options: String::new(),
            ..SecurityHeaders::default()
        };
        attach_essentials(&router, &server, security).unwrap();
        let app = router.freeze();

        let response = app.oneshot(request("/hello")).await.unwrap();
        assert!(response.headers().get("x-frame-options").is_none());
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
    }

    #[tokio::test]
    async fn panics_become_empty_500s() {
        async fn blow_up() -> &'static str {
            panic!("boom");
        }
        let router = Router::new();
        router.get("/panic", blow_up).unwrap();
        attach_essentials(&router, &server_config(), SecurityHeaders::default()).unwrap();
        let app = router.freeze();

        let response = app.oneshot(request("/panic")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn gzip_compresses_when_the_client_accepts_it() {
        async fn page() -> String {
            "draken ".repeat(64)
        }
        let router = Router::new();
        router.get("/page", page).unwrap();
        attach_essentials(&router, &server_config(), SecurityHeaders::default()).unwrap();
        let app = router.freeze();

        let request = Request::builder()
            .uri("/page")
            .header(header::ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
    }

    #[tokio::test]
    async fn access_log_prefers_x_real_ip() {
        // The logger itself writes to tracing; here we only pin that the
        // request still flows through with the proxy headers set.
        let app = essential_app(&server_config());
        let request = Request::builder()
            .uri("/hello")
            .header("x-real-ip", "203.0.113.9")
            .header("x-forwarded-for", "198.51.100.1, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
