//! HTTP Digest response computation (RFC 2617 / RFC 7616).

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// Parse an `algorithm` token into the hash and whether it is a `-sess` variant.
    pub fn parse(token: &str) -> Result<(Self, bool), AuthError> {
        let upper = token.trim().to_ascii_uppercase();
        let (base, sess) = match upper.strip_suffix("-SESS") {
            Some(base) => (base.to_string(), true),
            None => (upper.clone(), false),
        };
        match base.as_str() {
            "MD5" => Ok((DigestAlgorithm::Md5, sess)),
            "SHA-256" => Ok((DigestAlgorithm::Sha256, sess)),
            _ => Err(AuthError::Unsupported(format!("digest algorithm {}", token.trim()))),
        }
    }

    pub fn name(&self, sess: bool) -> String {
        let base = match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
        };
        if sess {
            format!("{}-sess", base)
        } else {
            base.to_string()
        }
    }

    pub fn hash(&self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Md5 => hex::encode(Md5::digest(data)),
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    /// Pick from a server's comma separated qop list, preferring `auth`.
    pub fn choose(offered: &str) -> Option<Self> {
        let options: Vec<String> = offered
            .split(',')
            .map(|o| o.trim().to_ascii_lowercase())
            .collect();
        if options.iter().any(|o| o == "auth") {
            Some(Qop::Auth)
        } else if options.iter().any(|o| o == "auth-int") {
            Some(Qop::AuthInt)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

/// Inputs to one Digest computation.
#[derive(Debug, Clone)]
pub struct DigestInput<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub realm: &'a str,
    pub nonce: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
    pub algorithm: DigestAlgorithm,
    pub sess: bool,
    pub qop: Option<Qop>,
    pub nc: u32,
    pub cnonce: &'a str,
    pub body: &'a [u8],
}

impl DigestInput<'_> {
    pub fn nc_hex(&self) -> String {
        format!("{:08x}", self.nc)
    }

    pub fn response(&self) -> String {
        let h = |data: String| self.algorithm.hash(data.as_bytes());

        let mut ha1 = h(format!("{}:{}:{}", self.username, self.realm, self.password));
        if self.sess {
            ha1 = h(format!("{}:{}:{}", ha1, self.nonce, self.cnonce));
        }

        let ha2 = match self.qop {
            Some(Qop::AuthInt) => h(format!(
                "{}:{}:{}",
                self.method,
                self.uri,
                self.algorithm.hash(self.body)
            )),
            _ => h(format!("{}:{}", self.method, self.uri)),
        };

        match self.qop {
            Some(qop) => h(format!(
                "{}:{}:{}:{}:{}:{}",
                ha1,
                self.nonce,
                self.nc_hex(),
                self.cnonce,
                qop.as_str(),
                ha2
            )),
            None => h(format!("{}:{}:{}", ha1, self.nonce, ha2)),
        }
    }

    /// Full `Authorization` header value.
    pub fn header(&self, opaque: Option<&str>) -> String {
        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", algorithm={}, response="{}""#,
            quote(self.username),
            quote(self.realm),
            quote(self.nonce),
            quote(self.uri),
            self.algorithm.name(self.sess),
            self.response()
        );
        if let Some(qop) = self.qop {
            header.push_str(&format!(
                r#", qop={}, nc={}, cnonce="{}""#,
                qop.as_str(),
                self.nc_hex(),
                quote(self.cnonce)
            ));
        }
        if let Some(opaque) = opaque {
            header.push_str(&format!(r#", opaque="{}""#, quote(opaque)));
        }
        header
    }
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
