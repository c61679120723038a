//! WS-Security UsernameToken with PasswordDigest.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};
use sha2::Sha256;

use crate::xml::{escape, WSSE_NS, WSU_NS};

const PASSWORD_DIGEST_TYPE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest";
const BASE64_ENCODING_TYPE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";

/// Hash used for the PasswordDigest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WssDigest {
    #[default]
    Sha1,
    Sha256,
}

/// base64(hash(nonce ‖ created ‖ password))
pub fn password_digest(nonce: &[u8], created: &str, password: &str, digest: WssDigest) -> String {
    let hash = match digest {
        WssDigest::Sha1 => {
            let mut hasher = Sha1::new();
            hasher.update(nonce);
            hasher.update(created.as_bytes());
            hasher.update(password.as_bytes());
            hasher.finalize().to_vec()
        }
        WssDigest::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(nonce);
            hasher.update(created.as_bytes());
            hasher.update(password.as_bytes());
            hasher.finalize().to_vec()
        }
    };
    general_purpose::STANDARD.encode(hash)
}

/// Timestamp format for `wsu:Created`.
pub fn created_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Build the `wsse:Security` header block.
pub fn security_header(
    username: &str,
    password: &str,
    nonce: &[u8],
    created: DateTime<Utc>,
    digest: WssDigest,
) -> String {
    let created = created_timestamp(created);
    let password_digest = password_digest(nonce, &created, password, digest);
    let nonce_b64 = general_purpose::STANDARD.encode(nonce);

    format!(
        concat!(
            r#"<wsse:Security s:mustUnderstand="1" xmlns:wsse="{wsse}" xmlns:wsu="{wsu}">"#,
            "<wsse:UsernameToken>",
            "<wsse:Username>{username}</wsse:Username>",
            r#"<wsse:Password Type="{password_type}">{password_digest}</wsse:Password>"#,
            r#"<wsse:Nonce EncodingType="{encoding_type}">{nonce}</wsse:Nonce>"#,
            "<wsu:Created>{created}</wsu:Created>",
            "</wsse:UsernameToken>",
            "</wsse:Security>"
        ),
        wsse = WSSE_NS,
        wsu = WSU_NS,
        username = escape(username),
        password_type = PASSWORD_DIGEST_TYPE,
        password_digest = password_digest,
        encoding_type = BASE64_ENCODING_TYPE,
        nonce = nonce_b64,
        created = created,
    )
}
