//! Client for the text-completion upstream.
//!
//! The upstream is an Ollama-style generate API: `POST
//! {base}/api/generate` with `{model, prompt, stream: false}`, answered
//! by a JSON object whose `response` field carries the generated text.
//! The gateway treats it as an opaque prompt-in, text-out function.
//!
//! The upstream enforces its own quotas: a 429 from it maps to
//! [`GatewayError::UpstreamRateLimited`], which is deliberately distinct
//! from this gateway's own rate-limit denial.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::full_body;
use crate::{BoxBody, GatewayError, Result, RuntimeConfig};

/// The HTTP client type for plain TCP upstream connections.
pub type HttpClient = Client<HttpConnector, BoxBody>;

/// The HTTPS client type for TLS-secured upstream connections.
pub type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, BoxBody>;

/// Constructs a new [`HttpClient`] for a plain-HTTP upstream.
pub fn build_client(config: &RuntimeConfig) -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(config.connect_timeout));

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build(connector)
}

/// Constructs a new [`HttpsClient`] for a TLS-secured upstream, using
/// the Mozilla root certificate store for server verification.
pub fn build_https_client(config: &RuntimeConfig) -> HttpsClient {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(config.connect_timeout));
    connector.enforce_http(false);

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .wrap_connector(connector);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build(connector)
}

/// Wire format of a generate call.
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// Wire format of a generate response. Extra upstream fields are ignored.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Sends `prompt` to the completion upstream and returns the generated
/// text.
///
/// Timeout enforcement is the caller's concern; this function runs the
/// round-trip to completion.
pub async fn complete<C>(
    client: &Client<C, BoxBody>,
    config: &RuntimeConfig,
    prompt: &str,
) -> Result<String>
where
    C: hyper_util::client::legacy::connect::Connect + Clone + Send + Sync + 'static,
{
    let uri = generate_uri(&config.upstream_url)?;

    let payload = serde_json::to_string(&GenerateRequest {
        model: &config.model,
        prompt,
        stream: false,
    })
    .map_err(|e| GatewayError::Internal(format!("failed to encode generate request: {e}")))?;

    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(full_body(payload))
        .map_err(|e| GatewayError::Internal(format!("failed to build upstream request: {e}")))?;

    let resp = client
        .request(req)
        .await
        .map_err(|e| GatewayError::Upstream(e.to_string()))?;

    let status = resp.status();
    debug!(status = status.as_u16(), "completion upstream responded");

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(GatewayError::UpstreamRateLimited);
    }
    if !status.is_success() {
        return Err(GatewayError::Upstream(format!(
            "upstream returned {status}"
        )));
    }

    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| GatewayError::Upstream(format!("failed to read upstream body: {e}")))?
        .to_bytes();

    parse_generate_response(&body)
}

/// Builds the generate-endpoint URI from the configured upstream base.
fn generate_uri(base: &Uri) -> Result<Uri> {
    let authority = base
        .authority()
        .ok_or_else(|| GatewayError::InvalidUpstream("upstream has no authority".into()))?;
    let scheme = base
        .scheme()
        .ok_or_else(|| GatewayError::InvalidUpstream("upstream has no scheme".into()))?;

    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query("/api/generate")
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to build upstream URI: {e}")))
}

fn parse_generate_response(body: &Bytes) -> Result<String> {
    serde_json::from_slice::<GenerateResponse>(body)
        .map(|r| r.response)
        .map_err(|e| GatewayError::Upstream(format!("unparseable upstream response: {e}")))
}
