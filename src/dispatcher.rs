use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use http::{HeaderMap, HeaderValue, StatusCode};
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Response, Uri};
use tracing::{debug, warn};

use crate::pool::ServerPool;
use crate::strategies::ServerSelectionStrategy;
use crate::tracker::{ConnectionGuard, ConnectionTracker};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Per-request entry point: select a backend, forward, stream the answer back.
///
/// Backend failures become `502 Bad Gateway` and never change health state;
/// only the health probe does that.
#[derive(Clone)]
pub struct Dispatcher {
    pool: ServerPool,
    tracker: ConnectionTracker,
    strategy: Arc<dyn ServerSelectionStrategy>,
    client: Client<HttpConnector, Body>,
    request_counter: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(
        pool: ServerPool,
        tracker: ConnectionTracker,
        strategy: Arc<dyn ServerSelectionStrategy>,
    ) -> Self {
        Self {
            pool,
            tracker,
            strategy,
            client: Client::new(),
            request_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total requests seen, including the ones answered with 503.
    pub fn requests_handled(&self) -> u64 {
        self.request_counter.load(Ordering::Relaxed)
    }

    pub async fn handle(&self, req: Request<Body>, client_addr: SocketAddr) -> Response<Body> {
        self.request_counter.fetch_add(1, Ordering::Relaxed);

        let backend = match self
            .strategy
            .pick_server(&self.pool, &self.tracker, client_addr.ip())
        {
            Ok(backend) => backend,
            Err(e) if e.is_unavailable() => {
                warn!(client = %client_addr, error = %e, "no backend available");
                return response_with_status(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
            }
            Err(e) => {
                warn!(client = %client_addr, error = %e, "backend selection failed");
                return response_with_status(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                );
            }
        };

        // Dropped on every exit path below, or moved into the response body
        // and dropped once the body is finished or abandoned.
        let guard = self
            .strategy
            .tracks_connections()
            .then(|| self.tracker.track(&backend));

        debug!(
            client = %client_addr,
            method = %req.method(),
            path = req.uri().path(),
            backend = %backend,
            "forwarding request"
        );

        let outbound = match rewrite_request(req, &backend, client_addr) {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!(backend = %backend, error = %e, "invalid backend URI");
                return response_with_status(StatusCode::BAD_GATEWAY, "Invalid backend URI");
            }
        };

        match self.client.request(outbound).await {
            Ok(resp) => {
                let (mut parts, body) = resp.into_parts();
                sanitize_hop_by_hop_headers(&mut parts.headers);
                let body = match guard {
                    Some(guard) => Body::wrap_stream(TrackedBody {
                        inner: body,
                        _guard: guard,
                    }),
                    None => body,
                };
                Response::from_parts(parts, body)
            }
            Err(e) => {
                warn!(backend = %backend, client = %client_addr, error = %e, "upstream request failed");
                response_with_status(StatusCode::BAD_GATEWAY, "Upstream request failed")
            }
        }
    }
}

/// Response body that keeps its backend's connection slot open until hyper
/// drops it.
struct TrackedBody {
    inner: Body,
    _guard: ConnectionGuard,
}

impl Stream for TrackedBody {
    type Item = Result<Bytes, hyper::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        Stream::size_hint(&self.inner)
    }
}

/// Points the request at `backend`, keeping method, body and end-to-end
/// headers.
fn rewrite_request(
    req: Request<Body>,
    backend: &str,
    client_addr: SocketAddr,
) -> Result<Request<Body>, http::Error> {
    let (mut parts, body) = req.into_parts();
    let backend_uri: Uri = backend.parse()?;
    parts.uri = upstream_uri(&backend_uri, &parts.uri)?;

    sanitize_hop_by_hop_headers(&mut parts.headers);
    if let Some(authority) = backend_uri.authority() {
        parts.headers.insert(
            http::header::HOST,
            HeaderValue::from_str(authority.as_str())?,
        );
    }
    append_forwarded_for(&mut parts.headers, client_addr);

    Ok(Request::from_parts(parts, body))
}

fn upstream_uri(backend: &Uri, original: &Uri) -> Result<Uri, http::Error> {
    let path = join_path(backend.path(), original.path());
    let path_and_query = match original.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path,
    };

    let mut builder = Uri::builder().path_and_query(path_and_query.as_str());
    if let Some(scheme) = backend.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = backend.authority() {
        builder = builder.authority(authority.clone());
    }
    builder.build()
}

/// Joins a backend path prefix and a request path with exactly one `/`.
fn join_path(prefix: &str, path: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };
    match (prefix.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", prefix, &path[1..]),
        (false, false) => format!("{}/{}", prefix, path),
        _ => format!("{}{}", prefix, path),
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

/// Strips the fixed hop-by-hop set plus any header named in `Connection`
/// (RFC 7230 section 6.1).
fn sanitize_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed.iter().map(String::as_str).chain(HOP_BY_HOP.iter().copied()) {
        headers.remove(name);
    }
}

/// Plain-text error reply generated by the dispatcher itself.
pub(crate) fn response_with_status(status: StatusCode, msg: &'static str) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::{LeastConnectionsStrategy, RoundRobinStrategy};

    fn client() -> SocketAddr {
        "10.0.0.5:40000".parse().unwrap()
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "/users"), "/users");
        assert_eq!(join_path("/api", "/users"), "/api/users");
        assert_eq!(join_path("/api/", "/users"), "/api/users");
        assert_eq!(join_path("/api", "users"), "/api/users");
        assert_eq!(join_path("/api", ""), "/api/");
        assert_eq!(join_path("", ""), "/");
    }

    #[test]
    fn test_upstream_uri_keeps_query_and_prefix() {
        let backend: Uri = "http://10.1.1.1:9000/v1".parse().unwrap();
        let original: Uri = "/items?page=2&sort=asc".parse().unwrap();

        let uri = upstream_uri(&backend, &original).unwrap();
        assert_eq!(uri.to_string(), "http://10.1.1.1:9000/v1/items?page=2&sort=asc");
    }

    #[test]
    fn test_rewrite_request_headers() {
        let req = Request::builder()
            .method("POST")
            .uri("/bookings")
            .header("host", "crm.example.com")
            .header("connection", "keep-alive")
            .header("x-forwarded-for", "203.0.113.7")
            .header("x-request-id", "abc")
            .body(Body::empty())
            .unwrap();

        let out = rewrite_request(req, "http://backend-1:8080", client()).unwrap();
        assert_eq!(out.method(), "POST");
        assert_eq!(out.uri().to_string(), "http://backend-1:8080/bookings");
        assert_eq!(out.headers()["host"], "backend-1:8080");
        assert_eq!(out.headers()["x-forwarded-for"], "203.0.113.7, 10.0.0.5");
        assert_eq!(out.headers()["x-request-id"], "abc");
        assert!(out.headers().get("connection").is_none());
    }

    #[test]
    fn test_sanitize_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        sanitize_hop_by_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn test_sanitize_removes_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.append("connection", HeaderValue::from_static("X-Trace-Hop, close"));
        headers.append("connection", HeaderValue::from_static("x-internal-token"));
        headers.insert("x-trace-hop", HeaderValue::from_static("1"));
        headers.insert("x-internal-token", HeaderValue::from_static("secret"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        sanitize_hop_by_hop_headers(&mut headers);
        assert!(headers.get("x-trace-hop").is_none());
        assert!(headers.get("x-internal-token").is_none());
        assert!(headers.get("connection").is_none());
        assert_eq!(headers["x-request-id"], "abc");
    }

    #[test]
    fn test_response_with_status() {
        let resp = response_with_status(StatusCode::BAD_GATEWAY, "Upstream request failed");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.headers()[http::header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_empty_pool_returns_503() {
        let pool = ServerPool::new();
        let tracker = ConnectionTracker::new(pool.clone());
        let dispatcher = Dispatcher::new(pool, tracker, Arc::new(RoundRobinStrategy::new()));

        let resp = dispatcher
            .handle(Request::new(Body::empty()), client())
            .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(dispatcher.requests_handled(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_returns_502_and_releases_slot() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = ServerPool::new();
        let backend = pool.add_server(&format!("http://{}", addr)).unwrap();
        let tracker = ConnectionTracker::new(pool.clone());
        let dispatcher = Dispatcher::new(
            pool.clone(),
            tracker.clone(),
            Arc::new(LeastConnectionsStrategy::new()),
        );

        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let resp = dispatcher.handle(req, client()).await;

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(tracker.connections(&backend), Some(0));
        // Forwarding failures leave health alone.
        assert_eq!(pool.is_healthy(&backend), Some(true));
    }
}
