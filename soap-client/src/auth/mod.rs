//! Per-device authentication negotiation.
//!
//! A device starts with no auth scheme. The first challenge (HTTP 401, or a
//! SOAP fault carrying an authorization failure) selects one of WS-Security
//! UsernameToken, HTTP Digest or HTTP Basic. From then on every request made
//! through [`AuthNegotiator::authorize`] carries credentials for that scheme.
//!
//! ```text
//! NoAuth ──challenge──▶ Challenged ──200──▶ Authenticated
//!                           ▲                    │
//!                           └──── stale=true ◀── Stale
//! ```

pub mod challenge;
pub mod digest;
pub mod nonce;
pub mod wss;

use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::AuthError;
use crate::xml::Fault;

pub use challenge::{parse_challenges, Challenge};
pub use digest::{DigestAlgorithm, DigestInput, Qop};
pub use nonce::{ClientNonce, CLIENT_NONCE_LIFETIME};
pub use wss::WssDigest;

/// Selected authentication scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthScheme {
    #[default]
    None,
    Wss,
    Digest,
    Basic,
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthScheme::None => "none",
            AuthScheme::Wss => "WS-Security",
            AuthScheme::Digest => "Digest",
            AuthScheme::Basic => "Basic",
        };
        f.write_str(name)
    }
}

/// Where a device sits in the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthPhase {
    #[default]
    NoAuth,
    Challenged,
    Authenticated,
    Stale,
}

/// Username and password for one device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authentication behavior shared by all devices.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Hash for the WS-Security PasswordDigest
    /// Default: SHA-1
    pub wss_digest: WssDigest,

    /// How long a client nonce is reused
    /// Default: 300 seconds
    pub nonce_lifetime: Duration,

    /// Prefer Digest over Basic when both are offered
    /// Default: true
    pub prefer_digest: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            wss_digest: WssDigest::Sha1,
            nonce_lifetime: CLIENT_NONCE_LIFETIME,
            prefer_digest: true,
        }
    }
}

impl AuthConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wss_digest(mut self, digest: WssDigest) -> Self {
        self.wss_digest = digest;
        self
    }

    pub fn with_nonce_lifetime(mut self, lifetime: Duration) -> Self {
        self.nonce_lifetime = lifetime;
        self
    }
}

/// Negotiated per-device state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthState {
    pub scheme: AuthScheme,
    pub phase: AuthPhase,
    pub realm: Option<String>,
    pub server_nonce: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: DigestAlgorithm,
    pub sess: bool,
    pub qop: Option<Qop>,
    #[serde(skip)]
    pub client_nonce: Option<ClientNonce>,
    pub nonce_count: u32,
    pub prior_nonce: Option<String>,
    pub stale: bool,
    /// Device clock minus local clock, in seconds
    pub clock_offset_secs: i64,
}

impl AuthState {
    /// Current client nonce, regenerated once older than `lifetime`.
    pub fn client_nonce(&mut self, lifetime: Duration) -> &ClientNonce {
        let expired = self
            .client_nonce
            .as_ref()
            .map_or(true, |nonce| nonce.is_expired(lifetime));
        if expired {
            self.client_nonce = Some(ClientNonce::generate());
        }
        self.client_nonce.get_or_insert_with(ClientNonce::generate)
    }

    /// Adopt a server nonce. The nonce count restarts only when it changes.
    fn adopt_server_nonce(&mut self, nonce: String) {
        if self.server_nonce.as_deref() != Some(nonce.as_str()) {
            self.prior_nonce = self.server_nonce.replace(nonce);
            self.nonce_count = 0;
        }
    }
}

/// Credentials to attach to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    None,
    /// `wsse:Security` header block for the SOAP envelope
    WsSecurity(String),
    /// HTTP `Authorization` header value
    Header(String),
}

/// Choose an auth scheme from a failed response and update `state`.
///
/// `attempted` tells whether the failed request already carried
/// credentials. A repeat challenge for the same scheme without `stale=true`
/// means the credentials are wrong.
pub fn negotiate(
    state: &mut AuthState,
    status: u16,
    www_authenticate: &[String],
    fault: Option<&Fault>,
    has_credentials: bool,
    attempted: bool,
    config: &AuthConfig,
) -> Result<AuthScheme, AuthError> {
    let challenges: Vec<Challenge> = www_authenticate
        .iter()
        .flat_map(|value| parse_challenges(value))
        .collect();

    let digest = challenges.iter().find(|c| c.is("Digest"));
    let basic = challenges.iter().find(|c| c.is("Basic"));

    if !challenges.is_empty() && digest.is_none() && basic.is_none() {
        let offered: Vec<&str> = challenges.iter().map(|c| c.scheme.as_str()).collect();
        return Err(AuthError::Unsupported(offered.join(", ")));
    }

    if !has_credentials {
        return Err(AuthError::MissingCredentials);
    }

    let use_digest = match (digest, basic) {
        (Some(_), Some(_)) => config.prefer_digest,
        (Some(_), None) => true,
        _ => false,
    };

    if use_digest {
        if let Some(challenge) = digest {
            match apply_digest(state, challenge, attempted) {
                Ok(()) => return Ok(AuthScheme::Digest),
                // A Basic alternative still works when the digest flavor is unknown
                Err(AuthError::Unsupported(_)) if basic.is_some() => {}
                Err(e) => return Err(e),
            }
        }
    }

    if let Some(challenge) = basic {
        if attempted && state.scheme == AuthScheme::Basic {
            return Err(AuthError::Rejected);
        }
        state.scheme = AuthScheme::Basic;
        state.phase = AuthPhase::Challenged;
        state.realm = challenge.param("realm").map(str::to_string);
        return Ok(AuthScheme::Basic);
    }

    let wss_fault = fault.map_or(false, Fault::is_auth_failure);
    if wss_fault || status == 401 {
        if attempted && state.scheme == AuthScheme::Wss {
            return Err(AuthError::Rejected);
        }
        state.scheme = AuthScheme::Wss;
        state.phase = AuthPhase::Challenged;
        return Ok(AuthScheme::Wss);
    }

    Err(AuthError::MalformedChallenge(format!(
        "status {} without a recognizable challenge",
        status
    )))
}

fn apply_digest(state: &mut AuthState, challenge: &Challenge, attempted: bool) -> Result<(), AuthError> {
    let nonce = challenge
        .param("nonce")
        .ok_or_else(|| AuthError::MalformedChallenge("digest challenge without nonce".into()))?
        .to_string();
    let (algorithm, sess) = match challenge.param("algorithm") {
        Some(token) => DigestAlgorithm::parse(token)?,
        None => (DigestAlgorithm::Md5, false),
    };
    let qop = match challenge.param("qop") {
        Some(offered) => Some(
            Qop::choose(offered)
                .ok_or_else(|| AuthError::Unsupported(format!("digest qop {}", offered)))?,
        ),
        None => None,
    };
    let stale = challenge
        .param("stale")
        .map_or(false, |s| s.eq_ignore_ascii_case("true"));

    if attempted && state.scheme == AuthScheme::Digest && !stale {
        return Err(AuthError::Rejected);
    }

    if stale {
        debug!("digest nonce is stale, adopting the new one");
    }

    state.scheme = AuthScheme::Digest;
    state.realm = challenge.param("realm").map(str::to_string);
    state.opaque = challenge.param("opaque").map(str::to_string);
    state.algorithm = algorithm;
    state.sess = sess;
    state.qop = qop;
    state.stale = stale;
    state.adopt_server_nonce(nonce);
    state.phase = if stale { AuthPhase::Stale } else { AuthPhase::Challenged };
    Ok(())
}

/// Build credentials for one request and advance the digest nonce count.
pub fn authorize(
    state: &mut AuthState,
    credentials: Option<&Credentials>,
    config: &AuthConfig,
    method: &str,
    uri: &str,
    body: &[u8],
) -> Result<Authorization, AuthError> {
    if state.scheme == AuthScheme::None {
        return Ok(Authorization::None);
    }
    let credentials = credentials.ok_or(AuthError::MissingCredentials)?;

    match state.scheme {
        AuthScheme::None => Ok(Authorization::None),
        AuthScheme::Basic => {
            let token = general_purpose::STANDARD
                .encode(format!("{}:{}", credentials.username, credentials.password));
            Ok(Authorization::Header(format!("Basic {}", token)))
        }
        AuthScheme::Wss => {
            let created = Utc::now() + chrono::Duration::seconds(state.clock_offset_secs);
            let digest = config.wss_digest;
            let nonce = state.client_nonce(config.nonce_lifetime).bytes.clone();
            Ok(Authorization::WsSecurity(wss::security_header(
                &credentials.username,
                &credentials.password,
                &nonce,
                created,
                digest,
            )))
        }
        AuthScheme::Digest => {
            let server_nonce = state
                .server_nonce
                .clone()
                .ok_or_else(|| AuthError::MalformedChallenge("no server nonce".into()))?;
            let cnonce = state.client_nonce(config.nonce_lifetime).hex.clone();
            state.nonce_count += 1;
            let realm = state.realm.clone().unwrap_or_default();

            let input = DigestInput {
                username: &credentials.username,
                password: &credentials.password,
                realm: &realm,
                nonce: &server_nonce,
                method,
                uri,
                algorithm: state.algorithm,
                sess: state.sess,
                qop: state.qop,
                nc: state.nonce_count,
                cnonce: &cnonce,
                body,
            };
            Ok(Authorization::Header(input.header(state.opaque.as_deref())))
        }
    }
}

/// Thread-safe owner of one device's [`AuthState`].
pub struct AuthNegotiator {
    credentials: Option<Credentials>,
    config: AuthConfig,
    state: Mutex<AuthState>,
}

impl AuthNegotiator {
    pub fn new(credentials: Option<Credentials>, config: AuthConfig) -> Self {
        Self {
            credentials,
            config,
            state: Mutex::new(AuthState::default()),
        }
    }

    /// Resume from a persisted state. The client nonce is regenerated.
    pub fn with_state(mut self, state: AuthState) -> Self {
        self.state = Mutex::new(state);
        self
    }

    pub fn authorize(&self, method: &str, uri: &str, body: &[u8]) -> Result<Authorization, AuthError> {
        let mut state = self.state.lock();
        authorize(&mut state, self.credentials.as_ref(), &self.config, method, uri, body)
    }

    pub fn challenge(
        &self,
        status: u16,
        www_authenticate: &[String],
        fault: Option<&Fault>,
        attempted: bool,
    ) -> Result<AuthScheme, AuthError> {
        let mut state = self.state.lock();
        let previous = state.scheme;
        let scheme = negotiate(
            &mut state,
            status,
            www_authenticate,
            fault,
            self.credentials.is_some(),
            attempted,
            &self.config,
        )?;
        if previous != scheme {
            info!(from = %previous, to = %scheme, "auth scheme selected");
        }
        Ok(scheme)
    }

    /// Record a successful exchange and adopt any `nextnonce`.
    pub fn accept(&self, authentication_info: Option<&str>) {
        let mut state = self.state.lock();
        if state.scheme != AuthScheme::None {
            state.phase = AuthPhase::Authenticated;
        }
        if state.scheme == AuthScheme::Digest {
            if let Some(next) = authentication_info
                .map(challenge::parse_params)
                .and_then(|mut params| params.remove("nextnonce"))
            {
                debug!("adopting nextnonce from Authentication-Info");
                state.adopt_server_nonce(next);
            }
        }
    }

    pub fn set_clock_offset(&self, offset: chrono::Duration) {
        self.state.lock().clock_offset_secs = offset.num_seconds();
    }

    pub fn scheme(&self) -> AuthScheme {
        self.state.lock().scheme
    }

    pub fn phase(&self) -> AuthPhase {
        self.state.lock().phase
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Snapshot for persistence.
    pub fn state(&self) -> AuthState {
        self.state.lock().clone()
    }

    /// Forget everything learned; the next request starts unauthenticated.
    pub fn reset(&self) {
        let offset = self.state.lock().clock_offset_secs;
        *self.state.lock() = AuthState {
            clock_offset_secs: offset,
            ..AuthState::default()
        };
    }
}

impl fmt::Debug for AuthNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthNegotiator")
            .field("credentials", &self.credentials)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml;

    fn creds() -> Credentials {
        Credentials::new("admin", "secret")
    }

    fn digest_header(nonce: &str) -> Vec<String> {
        vec![format!(r#"Digest realm="cam", nonce="{}", qop="auth", opaque="o1""#, nonce)]
    }

    fn not_authorized_fault() -> Fault {
        let env = xml::parse(
            r#"<Envelope><Body><Fault><Code><Value>Sender</Value><Subcode><Value>ter:NotAuthorized</Value></Subcode></Code><Reason><Text>Sender not Authorized</Text></Reason></Fault></Body></Envelope>"#,
        )
        .unwrap();
        Fault::from_envelope(&env).unwrap()
    }

    #[test]
    fn test_no_scheme_means_no_credentials() {
        let negotiator = AuthNegotiator::new(Some(creds()), AuthConfig::default());
        assert_eq!(negotiator.authorize("POST", "/", b"").unwrap(), Authorization::None);
        assert_eq!(negotiator.phase(), AuthPhase::NoAuth);
    }

    #[test]
    fn test_digest_selected_and_nc_increments() {
        let negotiator = AuthNegotiator::new(Some(creds()), AuthConfig::default());
        let scheme = negotiator.challenge(401, &digest_header("abc123"), None, false).unwrap();
        assert_eq!(scheme, AuthScheme::Digest);
        assert_eq!(negotiator.phase(), AuthPhase::Challenged);

        let first = match negotiator.authorize("POST", "/onvif/device_service", b"").unwrap() {
            Authorization::Header(h) => h,
            other => panic!("Expected header, got {:?}", other),
        };
        assert!(first.contains(r#"nonce="abc123""#));
        assert!(first.contains("qop=auth"));
        assert!(first.contains("nc=00000001"));
        assert!(first.contains("cnonce=\""));
        assert!(first.contains(r#"opaque="o1""#));

        let second = match negotiator.authorize("POST", "/onvif/device_service", b"").unwrap() {
            Authorization::Header(h) => h,
            other => panic!("Expected header, got {:?}", other),
        };
        assert!(second.contains(r#"nonce="abc123""#));
        assert!(second.contains("nc=00000002"));
    }

    #[test]
    fn test_stale_resets_nc_and_keeps_scheme() {
        let negotiator = AuthNegotiator::new(Some(creds()), AuthConfig::default());
        negotiator.challenge(401, &digest_header("n1"), None, false).unwrap();
        negotiator.authorize("POST", "/", b"").unwrap();
        negotiator.authorize("POST", "/", b"").unwrap();
        assert_eq!(negotiator.state().nonce_count, 2);

        let stale = vec![r#"Digest realm="cam", nonce="n2", qop="auth", stale=true"#.to_string()];
        assert_eq!(negotiator.challenge(401, &stale, None, true).unwrap(), AuthScheme::Digest);

        let state = negotiator.state();
        assert_eq!(state.server_nonce.as_deref(), Some("n2"));
        assert_eq!(state.prior_nonce.as_deref(), Some("n1"));
        assert_eq!(state.nonce_count, 0);
        assert!(state.stale);

        match negotiator.authorize("POST", "/", b"").unwrap() {
            Authorization::Header(h) => assert!(h.contains("nc=00000001")),
            other => panic!("Expected header, got {:?}", other),
        }
    }

    #[test]
    fn test_repeat_digest_challenge_is_rejection() {
        let negotiator = AuthNegotiator::new(Some(creds()), AuthConfig::default());
        negotiator.challenge(401, &digest_header("n1"), None, false).unwrap();
        let err = negotiator.challenge(401, &digest_header("n1"), None, true).unwrap_err();
        assert_eq!(err, AuthError::Rejected);
    }

    #[test]
    fn test_fault_selects_wss() {
        let negotiator = AuthNegotiator::new(Some(creds()), AuthConfig::default());
        let fault = not_authorized_fault();
        assert_eq!(negotiator.challenge(400, &[], Some(&fault), false).unwrap(), AuthScheme::Wss);

        match negotiator.authorize("POST", "/", b"").unwrap() {
            Authorization::WsSecurity(header) => {
                assert!(header.contains("<wsse:Username>admin</wsse:Username>"));
                assert!(header.contains("PasswordDigest"));
            }
            other => panic!("Expected WS-Security, got {:?}", other),
        }
    }

    #[test]
    fn test_wss_reuses_client_nonce_within_lifetime() {
        let negotiator = AuthNegotiator::new(Some(creds()), AuthConfig::default());
        negotiator.challenge(400, &[], Some(&not_authorized_fault()), false).unwrap();
        negotiator.authorize("POST", "/", b"").unwrap();
        let first = negotiator.state().client_nonce.unwrap().bytes;
        negotiator.authorize("POST", "/", b"").unwrap();
        let second = negotiator.state().client_nonce.unwrap().bytes;
        assert_eq!(first, second);
    }

    #[test]
    fn test_client_nonce_regenerated_after_lifetime() {
        let config = AuthConfig::default().with_nonce_lifetime(Duration::ZERO);
        let negotiator = AuthNegotiator::new(Some(creds()), config);
        negotiator.challenge(400, &[], Some(&not_authorized_fault()), false).unwrap();
        negotiator.authorize("POST", "/", b"").unwrap();
        let first = negotiator.state().client_nonce.unwrap().bytes;
        negotiator.authorize("POST", "/", b"").unwrap();
        let second = negotiator.state().client_nonce.unwrap().bytes;
        assert_ne!(first, second);
    }

    #[test]
    fn test_basic_only() {
        let negotiator = AuthNegotiator::new(Some(creds()), AuthConfig::default());
        let header = vec![r#"Basic realm="cam""#.to_string()];
        assert_eq!(negotiator.challenge(401, &header, None, false).unwrap(), AuthScheme::Basic);
        assert_eq!(
            negotiator.authorize("GET", "/", b"").unwrap(),
            Authorization::Header("Basic YWRtaW46c2VjcmV0".to_string())
        );
    }

    #[test]
    fn test_digest_preferred_over_basic() {
        let negotiator = AuthNegotiator::new(Some(creds()), AuthConfig::default());
        let headers = vec![
            r#"Basic realm="cam""#.to_string(),
            r#"Digest realm="cam", nonce="n""#.to_string(),
        ];
        assert_eq!(negotiator.challenge(401, &headers, None, false).unwrap(), AuthScheme::Digest);
    }

    #[test]
    fn test_unknown_scheme_is_unsupported() {
        let negotiator = AuthNegotiator::new(Some(creds()), AuthConfig::default());
        let headers = vec!["Negotiate".to_string(), "NTLM".to_string()];
        let err = negotiator.challenge(401, &headers, None, false).unwrap_err();
        assert_eq!(err, AuthError::Unsupported("Negotiate, NTLM".to_string()));
    }

    #[test]
    fn test_unsupported_digest_algorithm() {
        let negotiator = AuthNegotiator::new(Some(creds()), AuthConfig::default());
        let headers = vec![r#"Digest realm="cam", nonce="n", algorithm=SHA-512-256"#.to_string()];
        assert!(matches!(
            negotiator.challenge(401, &headers, None, false),
            Err(AuthError::Unsupported(_))
        ));
    }

    #[test]
    fn test_missing_credentials() {
        let negotiator = AuthNegotiator::new(None, AuthConfig::default());
        let err = negotiator.challenge(401, &digest_header("n"), None, false).unwrap_err();
        assert_eq!(err, AuthError::MissingCredentials);
    }

    #[test]
    fn test_nextnonce_adopted_on_success() {
        let negotiator = AuthNegotiator::new(Some(creds()), AuthConfig::default());
        negotiator.challenge(401, &digest_header("n1"), None, false).unwrap();
        negotiator.authorize("POST", "/", b"").unwrap();
        negotiator.accept(Some(r#"nextnonce="n2", qop=auth"#));

        let state = negotiator.state();
        assert_eq!(state.phase, AuthPhase::Authenticated);
        assert_eq!(state.server_nonce.as_deref(), Some("n2"));
        assert_eq!(state.nonce_count, 0);
    }

    #[test]
    fn test_state_survives_serde_without_client_nonce() {
        let negotiator = AuthNegotiator::new(Some(creds()), AuthConfig::default());
        negotiator.challenge(401, &digest_header("n1"), None, false).unwrap();
        negotiator.authorize("POST", "/", b"").unwrap();

        let json = serde_json::to_string(&negotiator.state()).unwrap();
        let restored: AuthState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.scheme, AuthScheme::Digest);
        assert_eq!(restored.server_nonce.as_deref(), Some("n1"));
        assert!(restored.client_nonce.is_none());

        let resumed = AuthNegotiator::new(Some(creds()), AuthConfig::default()).with_state(restored);
        match resumed.authorize("POST", "/", b"").unwrap() {
            Authorization::Header(h) => assert!(h.contains("nc=00000002")),
            other => panic!("Expected header, got {:?}", other),
        }
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let printed = format!("{:?}", creds());
        assert!(printed.contains("admin"));
        assert!(!printed.contains("secret"));
    }
}
