use crate::server::oci::ProxyError;

/// A parsed `WWW-Authenticate: Bearer ...` challenge
///
/// Missing parameters are empty strings. An empty realm is accepted here and
/// fails later when the realm URL is parsed for the token fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub service: String,
    pub scope: String,
}

impl AuthChallenge {
    /// Parse a `WWW-Authenticate` header value
    ///
    /// Example header: `Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull"`
    ///
    /// Only a missing `Bearer ` scheme prefix is rejected. Parameters may come
    /// in any order, unknown parameters are ignored, and the first occurrence
    /// of a repeated parameter wins.
    pub fn parse(header: &str) -> Result<Self, ProxyError> {
        let (scheme, params) = header
            .split_once(' ')
            .ok_or_else(|| ProxyError::MalformedChallenge(header.to_string()))?;

        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(ProxyError::MalformedChallenge(header.to_string()));
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        for (name, value) in parse_params(params) {
            let slot = match name.as_str() {
                "realm" => &mut realm,
                "service" => &mut service,
                "scope" => &mut scope,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value);
            }
        }

        Ok(Self {
            realm: realm.unwrap_or_default(),
            service: service.unwrap_or_default(),
            scope: scope.unwrap_or_default(),
        })
    }
}

/// Split `name="value", name=token` pairs, honouring commas inside quotes
///
/// Parameter names are lowercased. Bare tokens without `=` are skipped.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            name.push(c);
            chars.next();
        }

        if chars.peek() != Some(&'=') {
            continue;
        }
        chars.next();

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value.truncate(value.trim_end().len());
        }

        params.push((name.trim().to_ascii_lowercase(), value));
    }

    params
}
