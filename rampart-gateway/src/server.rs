//! Server module: accepts connections and drives each request through
//! admission, selection, and forwarding.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rampart_core::admission::AdmissionControl;
use rampart_core::balancer::ServerPool;
use rampart_core::domain::backend::ConnectionGuard;

use crate::forward::HttpForwarder;

/// The request header that selects sticky routing and the session
/// admission path.
pub const SESSION_HEADER: &str = "Session-ID";

/// Everything a request needs, composed once at startup.
#[derive(Debug)]
pub struct Gateway {
    /// Backend selection and sticky sessions.
    pub pool: Arc<ServerPool>,
    /// Per-IP admission control.
    pub admission: AdmissionControl,
    /// The forwarding collaborator.
    pub forwarder: HttpForwarder,
}

/// Response body type: either a proxied upstream body or a small
/// gateway-generated text page.
type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// An upstream body that keeps its backend's connection counted until the
/// body itself completes, not just until the response headers arrive.
struct TrackedBody {
    inner: GatewayBody,
    _connection: ConnectionGuard,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Accept connections on `addr` until shutdown.
pub async fn run(
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let io = TokioIo::new(stream);
                let gateway = Arc::clone(&gateway);
                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        let gateway = Arc::clone(&gateway);
                        async move { handle_request(gateway, peer.ip(), req).await }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = ?err, "error serving connection");
                    }
                });
            }
        }
    }
}

/// Drive one request through the two decision engines and forward it.
async fn handle_request(
    gateway: Arc<Gateway>,
    client_ip: IpAddr,
    req: Request<Incoming>,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let session = session_token(req.headers());

    if let Err(rejection) = gateway.admission.admit(client_ip, session.is_some()) {
        warn!(%client_ip, %rejection, "request rejected");
        return Ok(text_response(
            StatusCode::TOO_MANY_REQUESTS,
            format!("{rejection}\n"),
        ));
    }

    let backend = match gateway.pool.select(session.as_deref()) {
        Ok(backend) => backend,
        Err(err) => {
            warn!(%client_ip, "selection failed: {err}");
            return Ok(text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{err}\n"),
            ));
        }
    };

    debug!(%client_ip, backend = %backend.addr(), "forwarding request");
    let connection = backend.track_connection();
    match gateway.forwarder.forward(backend.addr(), req).await {
        // The guard rides inside the body so slow downloads keep counting
        // toward the backend's in-flight total until the last byte is out.
        Ok(response) => Ok(response.map(|body| {
            TrackedBody {
                inner: body.boxed(),
                _connection: connection,
            }
            .boxed()
        })),
        Err(err) => {
            error!(backend = %backend.addr(), %err, "forwarding failed");
            Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "upstream request failed\n".to_string(),
            ))
        }
    }
}

/// Extract a non-empty session token from the request headers.
fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
}

/// Build a small plain-text response without any fallible plumbing.
fn text_response(status: StatusCode, body: String) -> Response<GatewayBody> {
    let body = Full::new(Bytes::from(body))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::domain::backend::Backend;

    #[test]
    fn connection_counts_until_the_response_body_is_dropped() {
        let backend = Arc::new(Backend::new(([127, 0, 0, 1], 9005).into()));
        let inner = Full::new(Bytes::from_static(b"payload"))
            .map_err(|never| match never {})
            .boxed();

        let tracked = TrackedBody {
            inner,
            _connection: backend.track_connection(),
        };
        assert_eq!(backend.active_connections(), 1);

        drop(tracked);
        assert_eq!(backend.active_connections(), 0);
    }

    #[test]
    fn session_token_requires_a_non_empty_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_token(&headers), None);

        headers.insert(SESSION_HEADER, HeaderValue::from_static(""));
        assert_eq!(session_token(&headers), None);

        headers.insert(SESSION_HEADER, HeaderValue::from_static("abc-123"));
        assert_eq!(session_token(&headers), Some("abc-123".to_string()));
    }

    #[test]
    fn text_response_carries_status_and_content_type() {
        let response = text_response(StatusCode::TOO_MANY_REQUESTS, "nope\n".to_string());
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
