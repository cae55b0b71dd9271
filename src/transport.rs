//! HTTP transport to a single TV.
//!
//! All traffic to the TV's control surface goes through the [`Transport`] trait, which keeps the
//! session and command logic independent of the HTTP client.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, HOST, PRAGMA};
use reqwest::Client;

use crate::error::{Outcome, VieraError};
use crate::settings::ClientSettings;
use crate::soap::{render_envelope, soap_action_header, RequestType};

/// A reply received from the TV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body, decoded as text.
    pub body: String,
}

impl TransportReply {
    pub fn new(status: u16, body: &str) -> Self {
        TransportReply {
            status,
            body: body.into(),
        }
    }

    /// Whether the reply has a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Convert a non-2xx reply into an error describing `what` was being attempted.
    pub(crate) fn into_success(self, what: &str) -> Outcome<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            let msg = format!("{what} failed with HTTP status {}", self.status);
            warn!("{}", &msg);

            Err(VieraError::Connectivity(msg))
        }
    }
}

/// Sends requests to a TV's control surface.
///
/// Implementations return `Err` only when no reply was received (unreachable host, timeout).
/// Replies with non-2xx statuses are returned as `Ok` so callers can inspect the body.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a SOAP `body` to `path` with the given `SOAPACTION` header value.
    async fn post_soap(&self, path: &str, soap_action: &str, body: String)
        -> Outcome<TransportReply>;

    /// GET the document at `path`.
    async fn get(&self, path: &str) -> Outcome<TransportReply>;
}

/// [`Transport`] over HTTP, using one `reqwest` client per TV.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    host: String,
    base_url: String,
}

impl HttpTransport {
    pub fn new(ip: Ipv4Addr, settings: &ClientSettings) -> Outcome<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| VieraError::Internal(format!("Could not create HTTP client: {e}")))?;

        let host = format!("{}:{}", ip, settings.port);

        Ok(HttpTransport {
            client,
            base_url: format!("http://{host}"),
            host,
        })
    }

    /// The `http://ip:port` prefix for all requests.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn reply_from(response: reqwest::Response) -> Outcome<TransportReply> {
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(TransportReply { status, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_soap(
        &self,
        path: &str,
        soap_action: &str,
        body: String,
    ) -> Outcome<TransportReply> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {} ({})", &url, soap_action);

        let response = self
            .client
            .post(&url)
            .header(HOST, &self.host)
            .header(CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
            .header("SOAPACTION", soap_action)
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .header(ACCEPT, "text/xml")
            .body(body)
            .send()
            .await?;

        HttpTransport::reply_from(response).await
    }

    async fn get(&self, path: &str) -> Outcome<TransportReply> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", &url);

        let response = self.client.get(&url).send().await?;

        HttpTransport::reply_from(response).await
    }
}

/// Wrap `action` in a SOAP envelope and send it unencrypted.
pub(crate) async fn post_action<T: Transport + ?Sized>(
    transport: &T,
    request_type: RequestType,
    action: &str,
    parameters: &str,
) -> Outcome<TransportReply> {
    let urn = request_type.urn();

    transport
        .post_soap(
            request_type.path(),
            &soap_action_header(urn, action),
            render_envelope(action, urn, parameters),
        )
        .await
}

// ================================================================================================
// Tests
