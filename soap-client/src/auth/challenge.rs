//! `WWW-Authenticate` / `Authentication-Info` header parsing.

use std::collections::HashMap;

/// One challenge from a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    /// Auth-params with lowercased keys
    pub params: HashMap<String, String>,
}

impl Challenge {
    pub fn is(&self, scheme: &str) -> bool {
        self.scheme.eq_ignore_ascii_case(scheme)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Parse every challenge in a header value.
///
/// A single header may list several challenges, e.g.
/// `Digest realm="a", nonce="b", Basic realm="a"`.
pub fn parse_challenges(header: &str) -> Vec<Challenge> {
    let mut challenges: Vec<Challenge> = Vec::new();
    let chars: Vec<char> = header.chars().collect();
    let mut pos = 0;

    loop {
        while pos < chars.len() && (chars[pos].is_whitespace() || chars[pos] == ',') {
            pos += 1;
        }
        if pos >= chars.len() {
            break;
        }

        let start = pos;
        while pos < chars.len() && !chars[pos].is_whitespace() && chars[pos] != '=' && chars[pos] != ',' {
            pos += 1;
        }
        let token: String = chars[start..pos].iter().collect();

        let mut look = pos;
        while look < chars.len() && chars[look].is_whitespace() {
            look += 1;
        }

        if look < chars.len() && chars[look] == '=' {
            pos = look + 1;
            while pos < chars.len() && chars[pos].is_whitespace() {
                pos += 1;
            }
            let value = if pos < chars.len() && chars[pos] == '"' {
                read_quoted(&chars, &mut pos)
            } else {
                let start = pos;
                while pos < chars.len() && chars[pos] != ',' {
                    pos += 1;
                }
                chars[start..pos].iter().collect::<String>().trim().to_string()
            };
            if let Some(current) = challenges.last_mut() {
                current.params.insert(token.to_ascii_lowercase(), value);
            }
        } else {
            challenges.push(Challenge {
                scheme: token,
                params: HashMap::new(),
            });
        }
    }

    challenges
}

/// Parse a bare list of auth-params such as an `Authentication-Info` value.
pub fn parse_params(header: &str) -> HashMap<String, String> {
    // Reuse the challenge parser with a placeholder scheme
    parse_challenges(&format!("_ {}", header))
        .into_iter()
        .next()
        .map(|c| c.params)
        .unwrap_or_default()
}

fn read_quoted(chars: &[char], pos: &mut usize) -> String {
    let mut value = String::new();
    *pos += 1;
    while *pos < chars.len() {
        match chars[*pos] {
            '\\' if *pos + 1 < chars.len() => {
                value.push(chars[*pos + 1]);
                *pos += 2;
            }
            '"' => {
                *pos += 1;
                break;
            }
            c => {
                value.push(c);
                *pos += 1;
            }
        }
    }
    value
}
