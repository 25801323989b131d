//! HTTP API gateway: route match, authorize, admit, balance, forward, relay
//!
//! Per inbound request: find the most specific enabled route, check the
//! caller's roles, pay the route's token bucket, pick a healthy upstream,
//! forward with gateway headers and the per-route timeout, and relay the
//! response. The status contract is exactly 200/400/401/403/404/429/500/
//! 502/503/504.

use crate::config::GatewayConfig;
use crate::error::ConfigError;
use crate::gateway::health::run_health_probes;
use crate::gateway::rate_limit::RateDecision;
use crate::gateway::route::RouteTable;
use crate::metrics::SharedMetrics;
use crate::security::SecurityContext;
use crate::time_provider::{SharedTimeProvider, production_time_provider};
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Resolves a security context from request headers.
///
/// The gateway never authenticates; the host supplies this hook.
pub type Authenticator = Arc<dyn Fn(&HeaderMap) -> SecurityContext + Send + Sync>;

/// The API gateway service
pub struct Gateway {
    config: GatewayConfig,
    routes: Arc<RouteTable>,
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    metrics: SharedMetrics,
    authenticator: Authenticator,
    time: SharedTimeProvider,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Creates a gateway from configuration
    ///
    /// # Errors
    ///
    /// `ConfigError` for invalid global settings or routes.
    pub fn new(config: GatewayConfig, metrics: SharedMetrics) -> Result<Self, ConfigError> {
        config.validate()?;
        let routes = Arc::new(RouteTable::from_config(&config.routes)?);
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "gateway.client".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            routes,
            client,
            metrics,
            authenticator: Arc::new(|_headers| SecurityContext::anonymous()),
            time: production_time_provider(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Installs the authentication hook
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Overrides the time provider (tests)
    #[must_use]
    pub fn with_time_provider(mut self, time: SharedTimeProvider) -> Self {
        self.time = time;
        self
    }

    /// The route table
    #[must_use]
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Spawns the upstream health prober and the rate-limiter sweeper
    pub fn start_background(self: &Arc<Self>) {
        tokio::spawn(run_health_probes(
            self.routes.clone(),
            self.client.clone(),
            self.config.health_check.clone(),
            self.time.clone(),
            self.shutdown.clone(),
        ));
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = gateway.shutdown.cancelled() => break,
                    () = gateway.time.sleep(gateway.config.rate_limit_idle_eviction) => {}
                }
                for route in gateway.routes.routes() {
                    if let Some(limiter) = &route.limiter {
                        let evicted = limiter.sweep(gateway.config.rate_limit_idle_eviction);
                        if evicted > 0 {
                            debug!(route = route.pattern.as_str(), evicted, "rate limiter swept");
                        }
                    }
                }
            }
        });
    }

    /// Stops background tasks
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Builds the axum application for this gateway
    #[must_use]
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(handle_request).with_state(self)
    }

    /// Serves the gateway on the listener until shutdown
    ///
    /// # Errors
    ///
    /// I/O errors from the underlying server.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let shutdown = self.shutdown.clone();
        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, Response> {
        if self.config.queue_timeout.is_zero() {
            return self
                .semaphore
                .clone()
                .try_acquire_owned()
                .map_err(|_| status_response(StatusCode::SERVICE_UNAVAILABLE, "over capacity"));
        }
        match tokio::time::timeout(
            self.config.queue_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            _ => Err(status_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "over capacity",
            )),
        }
    }

    async fn process(&self, request: Request, client_addr: SocketAddr) -> Response {
        let started = Instant::now();
        self.metrics.incr("gateway.requests", 1);
        let _permit = match self.admit().await {
            Ok(permit) => permit,
            Err(response) => {
                self.metrics.incr("gateway.over_capacity", 1);
                return response;
            }
        };

        let method = request.method().as_str().to_string();
        let path = request.uri().path().to_string();
        let query = request.uri().query().map(ToString::to_string);

        let Some((route, params)) = self.routes.match_request(&method, &path) else {
            self.metrics.incr("gateway.not_found", 1);
            return status_response(StatusCode::NOT_FOUND, "no route");
        };

        let client_identity = client_identity(request.headers(), client_addr);

        if !route.config.required_roles.is_empty() {
            let ctx = (self.authenticator)(request.headers());
            if !ctx.is_authenticated() {
                self.metrics.incr("gateway.unauthenticated", 1);
                return status_response(StatusCode::UNAUTHORIZED, "authentication required");
            }
            if !route.config.required_roles.iter().any(|r| ctx.has_role(r)) {
                self.metrics.incr("gateway.forbidden", 1);
                return status_response(StatusCode::FORBIDDEN, "missing required role");
            }
        }

        if let Some(limiter) = &route.limiter
            && let RateDecision::Denied { retry_after_secs } = limiter.check(&client_identity)
        {
            self.metrics.incr("gateway.rate_limited", 1);
            return rate_limited_response(retry_after_secs);
        }

        let Some(upstream) = route.upstreams.select(&client_identity) else {
            self.metrics.incr("gateway.no_upstream", 1);
            return status_response(StatusCode::SERVICE_UNAVAILABLE, "no healthy upstream");
        };
        let _active = upstream.begin_request();

        let target = build_target_url(&upstream.url, &path, query.as_deref(), &params);
        let timeout = route.config.timeout.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT);
        let (parts, body) = request.into_parts();
        let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to read request body");
                return status_response(StatusCode::BAD_REQUEST, "unreadable request body");
            }
        };

        let reqwest_method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => return status_response(StatusCode::BAD_REQUEST, "unsupported method"),
        };
        let mut upstream_request = self
            .client
            .request(reqwest_method, &target)
            .timeout(timeout)
            .body(body_bytes.to_vec());

        for name in &route.config.headers.upstream {
            if let Some(value) = parts.headers.get(name.as_str())
                && let Ok(value) = value.to_str()
            {
                upstream_request = upstream_request.header(name.as_str(), value);
            }
        }
        let forwarded_for = match parts.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{existing}, {}", client_addr.ip()),
            None => client_addr.ip().to_string(),
        };
        let request_id = Uuid::new_v4().to_string();
        upstream_request = upstream_request
            .header("x-forwarded-for", forwarded_for)
            .header("x-forwarded-proto", "http")
            .header("x-request-id", &request_id);

        debug!(
            route = route.pattern.as_str(),
            upstream = %upstream.url,
            %request_id,
            "forwarding request"
        );

        let outcome = upstream_request.send().await;
        self.metrics
            .observe_duration("gateway.request.duration", started.elapsed());
        match outcome {
            Ok(upstream_response) => {
                upstream.record_success(self.config.health_check.healthy_threshold);
                self.metrics.incr("gateway.success", 1);
                relay_response(upstream_response, &route.config.headers.downstream).await
            }
            Err(err) if err.is_timeout() => {
                upstream.record_failure(self.config.health_check.unhealthy_threshold);
                self.metrics.incr("gateway.upstream_timeout", 1);
                warn!(upstream = %upstream.url, "upstream timed out");
                status_response(StatusCode::GATEWAY_TIMEOUT, "upstream timeout")
            }
            Err(err) => {
                upstream.record_failure(self.config.health_check.unhealthy_threshold);
                self.metrics.incr("gateway.upstream_error", 1);
                warn!(upstream = %upstream.url, error = %err, "upstream request failed");
                status_response(StatusCode::BAD_GATEWAY, "upstream error")
            }
        }
    }
}

async fn handle_request(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    gateway.process(request, client_addr).await
}

fn client_identity(headers: &HeaderMap, client_addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|chain| chain.split(',').next())
        .map(|first| first.trim().to_string())
        .unwrap_or_else(|| client_addr.ip().to_string())
}

fn build_target_url(
    upstream_url: &str,
    path: &str,
    query: Option<&str>,
    params: &HashMap<String, String>,
) -> String {
    // An upstream URL carrying placeholders takes the matched parameters;
    // otherwise the request path is appended to the base URL.
    let mut target = if upstream_url.contains('{') {
        let mut substituted = upstream_url.to_string();
        for (name, value) in params {
            substituted = substituted.replace(&format!("{{{name}}}"), value);
        }
        substituted
    } else {
        format!("{}{}", upstream_url.trim_end_matches('/'), path)
    };
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    target
}

fn status_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}

fn rate_limited_response(retry_after_secs: u64) -> Response {
    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header("retry-after", retry_after_secs.to_string())
        .header("content-type", "text/plain")
        .body(Body::from("rate limited"))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}

async fn relay_response(
    upstream_response: reqwest::Response,
    downstream_headers: &[(String, String)],
) -> Response {
    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);

    for (name, value) in upstream_response.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }
    for (name, value) in downstream_headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    match upstream_response.bytes().await {
        Ok(bytes) => builder.body(Body::from(bytes)).unwrap_or_else(|_| {
            status_response(StatusCode::INTERNAL_SERVER_ERROR, "relay failed")
        }),
        Err(err) => {
            warn!(error = %err, "failed to read upstream body");
            status_response(StatusCode::BAD_GATEWAY, "upstream body error")
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Binds a listener and serves the gateway, returning the bound address
///
/// # Errors
///
/// I/O errors binding the address.
pub async fn bind_gateway(
    gateway: Arc<Gateway>,
    addr: SocketAddr,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<std::io::Result<()>>)> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    info!(addr = %bound, "gateway listening");
    let handle = tokio::spawn(gateway.serve(listener));
    Ok((bound, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_url_appends_path_and_query() {
        let params = HashMap::new();
        assert_eq!(
            build_target_url("http://backend:8080/", "/api/orders", Some("page=2"), &params),
            "http://backend:8080/api/orders?page=2"
        );
    }

    #[test]
    fn target_url_substitutes_placeholders() {
        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        assert_eq!(
            build_target_url("http://backend:8080/orders/{id}", "/api/orders/42", None, &params),
            "http://backend:8080/orders/42"
        );
    }

    #[test]
    fn client_identity_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(client_identity(&headers, addr), "203.0.113.9");
        assert_eq!(client_identity(&HeaderMap::new(), addr), "127.0.0.1");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
