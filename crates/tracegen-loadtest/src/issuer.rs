/// Request issuer: sends one HTTP request per scheduled tick.
///
/// Every request carries its stage index (in the `X-Stage-Index` header by
/// default) so responses can be joined back to the trace sample that
/// produced them: `trace_index = stage_index / 2`.
///
/// Transport failures are never raised to the caller. A refused
/// connection, DNS failure or timeout becomes a `ResponseRecord` with a
/// failure status and unknown responder.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Url};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use tracegen_core::attribution::{Responder, ResponseRecord, ResponseStatus};

use crate::config::{AttributionSection, RequestSection};

/// Invalid target description; raised at setup, before any traffic.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid target url '{url}': {reason}")]
    Url { url: String, reason: String },
    #[error("invalid HTTP method '{0}'")]
    Method(String),
    #[error("invalid header '{name}': {reason}")]
    Header { name: String, reason: String },
}

/// Why a request got no response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

/// Fixed endpoint, method, payload and headers of one scenario.
#[derive(Debug)]
pub struct RequestTarget {
    /// Attribution label, `host[:port]` of the url
    pub label: String,
    pub url: Url,
    pub method: Method,
    pub body: String,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub stage_header: Option<HeaderName>,
}

impl RequestTarget {
    pub fn new(url: &str, request: &RequestSection) -> Result<Self, TargetError> {
        let parsed = Url::parse(url).map_err(|e| TargetError::Url {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        // The client is built without a TLS backend
        if parsed.scheme() != "http" {
            return Err(TargetError::Url {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}', only http is supported", parsed.scheme()),
            });
        }

        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| TargetError::Method(request.method.clone()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value("Content-Type", &request.content_type)?);
        for (name, value) in &request.headers {
            headers.insert(header_name(name)?, header_value(name, value)?);
        }

        let stage_header = if request.stage_header.is_empty() {
            None
        } else {
            Some(header_name(&request.stage_header)?)
        };

        Ok(Self {
            label: target_label(&parsed),
            url: parsed,
            method,
            body: request.body.clone(),
            headers,
            timeout: request.timeout(),
            stage_header,
        })
    }
}

/// `host:port` when the url has an explicit port, else the host, else the url.
pub fn target_label(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => url.to_string(),
    }
}

fn header_name(name: &str) -> Result<HeaderName, TargetError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|e| TargetError::Header {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, TargetError> {
    HeaderValue::from_str(value).map_err(|e| TargetError::Header {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// One request handed from the arrival engine to a worker.
#[derive(Debug, Clone)]
pub struct ScheduledRequest {
    pub target: Arc<RequestTarget>,
    pub stage_index: usize,
    /// Position in the scenario's dispatch order
    pub sequence: u64,
    pub scheduled_at: Instant,
}

impl ScheduledRequest {
    pub fn trace_index(&self) -> usize {
        tracegen_core::schedule::trace_index(self.stage_index)
    }
}

/// Anything that can turn a scheduled request into a response record.
pub trait Issue: Send + Sync + 'static {
    fn issue(&self, request: ScheduledRequest) -> impl Future<Output = ResponseRecord> + Send;
}

pub struct HttpIssuer {
    client: Client,
    address_header: HeaderName,
    node_header: HeaderName,
}

impl HttpIssuer {
    pub fn new(client: Client, attribution: &AttributionSection) -> Result<Self, TargetError> {
        Ok(Self {
            client,
            address_header: header_name(&attribution.responder_address_header)?,
            node_header: header_name(&attribution.responder_node_header)?,
        })
    }

    /// Pooled client keeping up to `warm_connections` idle connections per host.
    pub fn build_client(warm_connections: usize) -> reqwest::Result<Client> {
        Client::builder()
            .pool_max_idle_per_host(warm_connections)
            .build()
    }

    async fn send(&self, request: ScheduledRequest) -> ResponseRecord {
        let target = &request.target;
        let started = Instant::now();

        let mut builder = self
            .client
            .request(target.method.clone(), target.url.clone())
            .headers(target.headers.clone())
            .timeout(target.timeout)
            .body(target.body.clone());
        if let Some(name) = &target.stage_header {
            builder = builder.header(name.clone(), request.stage_index);
        }

        match builder.send().await {
            Ok(response) => {
                let status = ResponseStatus::Http(response.status().as_u16());
                let headers = response.headers();
                let responder_address = Responder::from_header(header_str(headers, &self.address_header));
                let responder_node_id = Responder::from_header(header_str(headers, &self.node_header));

                // Read the body so the connection returns to the pool
                if let Err(e) = response.bytes().await {
                    debug!(endpoint = %target.label, stage = request.stage_index, error = %e, "Response body read failed");
                }

                ResponseRecord {
                    status,
                    target: target.label.clone(),
                    responder_address,
                    responder_node_id,
                    stage_index: request.stage_index,
                    latency: started.elapsed(),
                }
            }
            Err(e) => {
                let error = TransportError::from(e);
                debug!(
                    endpoint = %target.label,
                    stage = request.stage_index,
                    trace_index = request.trace_index(),
                    error = %error,
                    "Request failed"
                );
                ResponseRecord::failure(target.label.clone(), request.stage_index, started.elapsed())
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl Issue for HttpIssuer {
    fn issue(&self, request: ScheduledRequest) -> impl Future<Output = ResponseRecord> + Send {
        self.send(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::Mutex;

    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::any;
    use axum::Router;

    async fn spawn_server(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn issuer() -> HttpIssuer {
        HttpIssuer::new(Client::new(), &AttributionSection::default()).unwrap()
    }

    fn request_to(url: &str, timeout_ms: u64, stage_index: usize) -> ScheduledRequest {
        let section = RequestSection {
            timeout_ms,
            ..RequestSection::default()
        };
        ScheduledRequest {
            target: Arc::new(RequestTarget::new(url, &section).unwrap()),
            stage_index,
            sequence: 0,
            scheduled_at: Instant::now(),
        }
    }

    #[test]
    fn test_target_label() {
        let section = RequestSection::default();
        let t = RequestTarget::new("http://10.0.2.38:30080/function/figlet", &section).unwrap();
        assert_eq!(t.label, "10.0.2.38:30080");
        let t = RequestTarget::new("http://gateway/function/figlet", &section).unwrap();
        assert_eq!(t.label, "gateway");
        assert_eq!(t.method, Method::POST);
        assert_eq!(t.headers.get(CONTENT_TYPE).unwrap(), "text/plain");
    }

    #[test]
    fn test_invalid_targets() {
        let section = RequestSection::default();
        assert!(matches!(RequestTarget::new("not a url", &section), Err(TargetError::Url { .. })));
        assert!(matches!(RequestTarget::new("ftp://host/x", &section), Err(TargetError::Url { .. })));

        let bad_method = RequestSection { method: "GE T".into(), ..RequestSection::default() };
        assert!(matches!(
            RequestTarget::new("http://host/", &bad_method),
            Err(TargetError::Method(_))
        ));

        let mut bad_header = RequestSection::default();
        bad_header.headers.insert("bad header".into(), "x".into());
        assert!(matches!(
            RequestTarget::new("http://host/", &bad_header),
            Err(TargetError::Header { .. })
        ));
    }

    #[test]
    fn test_https_rejected_at_setup() {
        let err = RequestTarget::new("https://127.0.0.1:1/function/figlet", &RequestSection::default())
            .unwrap_err();
        assert!(matches!(&err, TargetError::Url { reason, .. } if reason.contains("'https'")));
    }

    #[tokio::test]
    async fn test_attributed_response() {
        let app = Router::new().route(
            "/function/figlet",
            any(|| async { ([("X-Server", "10.0.2.39"), ("Dfaas-Node-Id", "node-b")], "ok") }),
        );
        let addr = spawn_server(app).await;

        let record = issuer()
            .issue(request_to(&format!("http://{addr}/function/figlet"), 2000, 3))
            .await;
        assert_eq!(record.status, ResponseStatus::Http(200));
        assert_eq!(record.target, addr.to_string());
        assert_eq!(record.responder_address, Responder::Known("10.0.2.39".into()));
        assert_eq!(record.responder_node_id, Responder::Known("node-b".into()));
        assert_eq!(record.stage_index, 3);
        assert_eq!(record.trace_index(), 1);
    }

    #[tokio::test]
    async fn test_missing_responder_headers() {
        let app = Router::new().route(
            "/busy",
            any(|| async { (StatusCode::TOO_MANY_REQUESTS, "busy") }),
        );
        let addr = spawn_server(app).await;

        let record = issuer().issue(request_to(&format!("http://{addr}/busy"), 2000, 0)).await;
        assert_eq!(record.status, ResponseStatus::Http(429));
        assert_eq!(record.responder_address, Responder::Unknown);
        assert_eq!(record.responder_node_id, Responder::Unknown);
    }

    #[tokio::test]
    async fn test_stage_header_and_payload_sent() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let app = Router::new().route(
            "/echo",
            any(move |headers: AxumHeaders, body: String| {
                let captured = Arc::clone(&captured);
                async move {
                    let stage = headers
                        .get("X-Stage-Index")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    captured.lock().unwrap().push((stage, body));
                    "ok"
                }
            }),
        );
        let addr = spawn_server(app).await;

        let record = issuer().issue(request_to(&format!("http://{addr}/echo"), 2000, 7)).await;
        assert_eq!(record.status, ResponseStatus::Http(200));
        assert_eq!(seen.lock().unwrap().as_slice(), &[("7".to_string(), "Ciao".to_string())]);
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure_record() {
        let app = Router::new().route(
            "/slow",
            any(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let addr = spawn_server(app).await;

        let record = issuer().issue(request_to(&format!("http://{addr}/slow"), 100, 2)).await;
        assert_eq!(record.status, ResponseStatus::Failure);
        assert_eq!(record.responder_address, Responder::Unknown);
        assert_eq!(record.stage_index, 2);
        assert!(record.latency < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connection_refused_is_a_failure_record() {
        // Grab a free port, then release it so nothing listens there
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let record = issuer().issue(request_to(&format!("http://127.0.0.1:{port}/"), 1000, 0)).await;
        assert_eq!(record.status, ResponseStatus::Failure);
        assert_eq!(record.target, format!("127.0.0.1:{port}"));
    }

    #[tokio::test]
    async fn test_transport_error_classification() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = Client::new()
            .get(format!("http://127.0.0.1:{port}/"))
            .send()
            .await
            .unwrap_err();
        assert!(matches!(TransportError::from(err), TransportError::Connect(_)));
    }
}
