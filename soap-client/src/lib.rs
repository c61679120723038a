//! Private SOAP client for ONVIF device communication
//!
//! This crate provides the request path every ONVIF operation goes through:
//! SOAP 1.2 envelopes over HTTP POST, per-device authentication
//! negotiation (WS-Security UsernameToken, HTTP Digest, HTTP Basic), a fixed
//! retry budget, and liveness reporting to whoever owns the device.

pub mod auth;
pub mod capabilities;
mod config;
mod error;
pub mod xml;

pub use auth::{AuthConfig, AuthNegotiator, AuthPhase, AuthScheme, AuthState, Credentials};
pub use capabilities::{DeviceInformation, RenewalMode, ServiceEndpoints, StreamingFlags};
pub use config::DispatchConfig;
pub use error::{AuthError, Result, SoapError, TransportKind};

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, USER_AGENT, WWW_AUTHENTICATE};
use tracing::{debug, warn};
use xmltree::Element;

use auth::Authorization;
use xml::Fault;

/// At most this many auth challenges are answered within one `send`.
const MAX_CHALLENGE_ROUNDS: u32 = 2;

/// Receives device reachability changes observed by the dispatcher.
pub trait LivenessSink: Send + Sync {
    fn mark_online(&self, urn: &str);
    fn mark_offline(&self, urn: &str, reason: &str);
}

/// One device as seen by the dispatcher: its key and its auth state.
#[derive(Debug)]
pub struct DeviceSession {
    urn: String,
    auth: AuthNegotiator,
}

impl DeviceSession {
    pub fn new(urn: impl Into<String>, credentials: Option<Credentials>, config: AuthConfig) -> Self {
        Self {
            urn: urn.into(),
            auth: AuthNegotiator::new(credentials, config),
        }
    }

    /// Resume a device whose auth state was persisted.
    pub fn with_auth_state(mut self, state: AuthState) -> Self {
        self.auth = self.auth.with_state(state);
        self
    }

    pub fn urn(&self) -> &str {
        &self.urn
    }

    pub fn auth(&self) -> &AuthNegotiator {
        &self.auth
    }
}

/// A SOAP request ready to be enveloped.
#[derive(Debug, Clone)]
pub struct SoapRequest {
    /// WSDL action URI, sent in the `Content-Type` action parameter
    pub action: String,
    /// Body element(s), declaring their own namespaces
    pub body: String,
    /// Add WS-Addressing `To`/`Action`/`MessageID` headers
    pub addressing: bool,
    /// Additional header elements, such as echoed reference parameters
    pub headers: Vec<String>,
}

impl SoapRequest {
    pub fn new(action: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            body: body.into(),
            addressing: false,
            headers: Vec::new(),
        }
    }

    pub fn with_addressing(mut self) -> Self {
        self.addressing = true;
        self
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.headers.push(header.into());
        self
    }
}

/// Successful response from a device.
#[derive(Debug, Clone)]
pub struct SoapResponse {
    pub status: u16,
    /// Raw response text
    pub body: String,
    /// Parsed envelope with namespaces stripped
    pub envelope: Element,
}

impl SoapResponse {
    /// The named element inside the SOAP Body.
    pub fn response(&self, name: &str) -> Result<&Element> {
        xml::body(&self.envelope)?
            .get_child(name)
            .ok_or_else(|| SoapError::Parse(format!("Missing {} element", name)))
    }
}

struct RawReply {
    status: u16,
    www_authenticate: Vec<String>,
    authentication_info: Option<String>,
    body: String,
}

/// Retrying SOAP dispatcher shared by all devices.
#[derive(Clone)]
pub struct SoapClient {
    http: reqwest::Client,
    config: DispatchConfig,
    liveness: Option<Arc<dyn LivenessSink>>,
}

impl SoapClient {
    /// Create a new SOAP client with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(DispatchConfig::default())
    }

    pub fn with_config(config: DispatchConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SoapError::Configuration(e.to_string()))?;
        Ok(Self {
            http,
            config,
            liveness: None,
        })
    }

    /// Report online/offline transitions to `sink`.
    pub fn with_liveness(mut self, sink: Arc<dyn LivenessSink>) -> Self {
        self.liveness = Some(sink);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Send `body` for `operation` (a WSDL action URI) to `service_url`.
    pub async fn send(
        &self,
        session: &DeviceSession,
        operation: &str,
        service_url: &str,
        body: &str,
        timeout: Option<Duration>,
    ) -> Result<SoapResponse> {
        self.send_request(session, service_url, &SoapRequest::new(operation, body), timeout)
            .await
    }

    /// Send a prepared request with the retry budget and auth negotiation.
    ///
    /// Transport failures and device faults are retried up to
    /// `max_attempts` times, `retry_delay` apart. Auth challenges are
    /// answered immediately and do not use up attempts. Auth errors are
    /// returned without retry. An exhausted budget marks the device offline.
    pub async fn send_request(
        &self,
        session: &DeviceSession,
        service_url: &str,
        request: &SoapRequest,
        timeout: Option<Duration>,
    ) -> Result<SoapResponse> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let uri = request_uri(service_url)?;

        let mut headers = Vec::new();
        if request.addressing {
            headers = xml::addressing_headers(&request.action, service_url);
        }
        headers.extend(request.headers.iter().cloned());
        let plain_envelope = xml::envelope(&headers, &request.body);

        let mut attempts = 0u32;
        let mut challenges = 0u32;
        let mut wait_before_next = false;
        let mut last_error: Option<SoapError> = None;

        while attempts < self.config.max_attempts {
            if wait_before_next {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            attempts += 1;

            let authorization = session.auth.authorize("POST", &uri, plain_envelope.as_bytes())?;
            let attempted = authorization != Authorization::None;
            let (envelope, http_auth) = match authorization {
                Authorization::None => (plain_envelope.clone(), None),
                Authorization::Header(value) => (plain_envelope.clone(), Some(value)),
                Authorization::WsSecurity(security) => {
                    let mut with_security = vec![security];
                    with_security.extend(headers.iter().cloned());
                    (xml::envelope(&with_security, &request.body), None)
                }
            };

            debug!(
                urn = session.urn(),
                action = %request.action,
                attempt = attempts,
                scheme = %session.auth.scheme(),
                "sending SOAP request"
            );

            let reply = match self
                .post(service_url, &request.action, envelope, http_auth, timeout)
                .await
            {
                Ok(reply) => reply,
                Err(err) => {
                    if err.is_host_down() {
                        self.report_offline(session, &err);
                        return Err(err);
                    }
                    warn!(urn = session.urn(), attempt = attempts, error = %err, "SOAP transport failure");
                    last_error = Some(err);
                    wait_before_next = true;
                    continue;
                }
            };

            // Any HTTP answer proves the device is reachable
            self.report_online(session);

            let parsed = xml::parse(&reply.body);
            let fault = parsed.as_ref().ok().and_then(Fault::from_envelope);

            if reply.status == 200 {
                let envelope = parsed?;
                if let Some(fault) = fault {
                    warn!(urn = session.urn(), code = fault.code(), reason = %fault.reason, "SOAP fault in 200 response");
                    return Err(fault.into());
                }
                session.auth.accept(reply.authentication_info.as_deref());
                return Ok(SoapResponse {
                    status: reply.status,
                    body: reply.body,
                    envelope,
                });
            }

            let auth_fault = fault.as_ref().map_or(false, Fault::is_auth_failure);
            if reply.status == 401 || auth_fault {
                challenges += 1;
                if challenges > MAX_CHALLENGE_ROUNDS {
                    return Err(AuthError::Rejected.into());
                }
                let scheme = session.auth.challenge(
                    reply.status,
                    &reply.www_authenticate,
                    fault.as_ref(),
                    attempted,
                )?;
                debug!(urn = session.urn(), %scheme, "answering auth challenge");
                attempts -= 1;
                wait_before_next = false;
                continue;
            }

            let err = match fault {
                Some(fault) => {
                    warn!(
                        urn = session.urn(),
                        status = reply.status,
                        code = fault.code(),
                        reason = %fault.reason,
                        "SOAP fault"
                    );
                    if fault.is_sender() {
                        return Err(fault.into());
                    }
                    SoapError::from(fault)
                }
                None => {
                    warn!(urn = session.urn(), status = reply.status, "unexpected HTTP status");
                    SoapError::Http(reply.status)
                }
            };
            last_error = Some(err);
            wait_before_next = true;
        }

        let err = last_error.unwrap_or(SoapError::Timeout(timeout));
        self.report_offline(session, &err);
        Err(err)
    }

    async fn post(
        &self,
        url: &str,
        action: &str,
        envelope: String,
        authorization: Option<String>,
        timeout: Duration,
    ) -> Result<RawReply> {
        let mut request = self
            .http
            .post(url)
            .timeout(timeout)
            .header(
                CONTENT_TYPE,
                format!("application/soap+xml; charset=utf-8; action=\"{}\"", action),
            )
            .header(USER_AGENT, &self.config.user_agent)
            .body(envelope);
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SoapError::from_reqwest(e, timeout))?;

        let status = response.status().as_u16();
        let www_authenticate = header_values(response.headers(), WWW_AUTHENTICATE.as_str());
        let authentication_info = header_values(response.headers(), "authentication-info")
            .into_iter()
            .next();
        let body = response
            .text()
            .await
            .map_err(|e| SoapError::from_reqwest(e, timeout))?;

        Ok(RawReply {
            status,
            www_authenticate,
            authentication_info,
            body,
        })
    }

    fn report_online(&self, session: &DeviceSession) {
        if let Some(sink) = &self.liveness {
            sink.mark_online(session.urn());
        }
    }

    fn report_offline(&self, session: &DeviceSession, err: &SoapError) {
        warn!(urn = session.urn(), error = %err, "device not responding");
        if let Some(sink) = &self.liveness {
            sink.mark_offline(session.urn(), &err.to_string());
        }
    }
}

impl std::fmt::Debug for SoapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoapClient")
            .field("config", &self.config)
            .field("liveness", &self.liveness.is_some())
            .finish()
    }
}

fn header_values(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect()
}

/// Request-URI used in Digest computations: path plus query.
fn request_uri(service_url: &str) -> Result<String> {
    let parsed = url::Url::parse(service_url)
        .map_err(|e| SoapError::Parse(format!("Invalid service URL {}: {}", service_url, e)))?;
    Ok(match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_string(),
    })
}
