//! Origin validation for upgrade requests
//!
//! Browsers always send `Origin` on WebSocket upgrades, so checking it
//! blocks cross-site socket hijacking. Requests without the header come
//! from non-browser clients and are admitted.

/// Origins used when none are configured
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &["http://localhost:3000", "http://localhost:8000"];

/// Allow-list consulted once per handshake
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<String>,
    allow_localhost: bool,
}

impl OriginPolicy {
    /// Build a policy; an empty list falls back to [`DEFAULT_ALLOWED_ORIGINS`]
    pub fn new<I, S>(allowed: I, allow_localhost: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed: Vec<String> = allowed
            .into_iter()
            .map(|origin| origin.as_ref().trim().trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        if allowed.is_empty() {
            allowed = DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect();
        }

        Self {
            allowed,
            allow_localhost,
        }
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed
    }

    /// Decide whether an upgrade with this `Origin` header may proceed
    pub fn allows(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };

        let origin = origin.trim_end_matches('/');
        if self.allowed.iter().any(|allowed| allowed == origin) {
            return true;
        }

        self.allow_localhost && is_local_origin(origin)
    }
}

impl Default for OriginPolicy {
    fn default() -> Self {
        Self::new(Vec::<String>::new(), true)
    }
}

/// `http(s)://localhost`, `127.0.0.1` or `[::1]`, any port
fn is_local_origin(origin: &str) -> bool {
    let Some((scheme, rest)) = origin.split_once("://") else {
        return false;
    };
    if scheme != "http" && scheme != "https" {
        return false;
    }

    let authority = rest.split('/').next().unwrap_or_default();
    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        match bracketed.split_once(']') {
            Some((host, _)) => host,
            None => return false,
        }
    } else {
        authority.split(':').next().unwrap_or_default()
    };

    matches!(host, "localhost" | "127.0.0.1" | "::1")
}
