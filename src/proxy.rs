//! Proxy selection for the WebSocket upgrade.
//!
//! A selector maps a target endpoint URL to an HTTP proxy URL (or none for
//! a direct connection). [`ProxySelector::FromEnv`] mirrors the usual
//! `http_proxy` / `https_proxy` / `no_proxy` environment conventions.

use std::env;

/// Decides whether the transport dials directly or through an HTTP proxy.
#[derive(Debug, Clone, Default)]
pub enum ProxySelector {
    /// Always connect directly.
    #[default]
    Direct,

    /// Resolve the proxy from `http_proxy` / `https_proxy` / `no_proxy`.
    FromEnv,

    /// Always tunnel through the given proxy URL, e.g. `http://127.0.0.1:3128`.
    Fixed(String),
}

impl ProxySelector {
    /// Return the proxy URL to use for `target`, or `None` for direct.
    pub fn select(&self, target: &str) -> Option<String> {
        match self {
            Self::Direct => None,
            Self::Fixed(url) => Some(url.clone()),
            Self::FromEnv => select_from_env(target, |name| env::var(name).ok()),
        }
    }
}

/// Env-based selection, parameterized over the variable lookup for tests.
fn select_from_env<F>(target: &str, getenv: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let host = host_of(target)?;

    let no_proxy = getenv("no_proxy").or_else(|| getenv("NO_PROXY"));
    if let Some(list) = no_proxy {
        for entry in list.split(',') {
            let entry = entry.trim().trim_start_matches('.');
            if entry.is_empty() {
                continue;
            }
            if entry == "*" || host == entry || host.ends_with(&format!(".{}", entry)) {
                return None;
            }
        }
    }

    let var = if target.starts_with("wss://") {
        "https_proxy"
    } else {
        "http_proxy"
    };
    getenv(var)
        .or_else(|| getenv(&var.to_uppercase()))
        .filter(|v| !v.is_empty())
}

/// Host portion of a `ws://` / `wss://` URL, without port or path.
fn host_of(url: &str) -> Option<&str> {
    let rest = url.split("://").nth(1)?;
    let authority = rest.split(['/', '?']).next()?;
    let host = authority.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> HashMap<String, String> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn lookup(map: &HashMap<String, String>) -> impl Fn(&str) -> Option<String> + '_ {
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_direct_and_fixed() {
        assert_eq!(ProxySelector::Direct.select("wss://x.example.com/v2"), None);
        assert_eq!(
            ProxySelector::Fixed("http://127.0.0.1:3128".to_string())
                .select("wss://x.example.com/v2"),
            Some("http://127.0.0.1:3128".to_string())
        );
    }

    #[test]
    fn test_env_scheme_selection() {
        let vars = env(&[
            ("http_proxy", "http://plain:8080"),
            ("https_proxy", "http://secure:8080"),
        ]);
        assert_eq!(
            select_from_env("wss://host.example.com/v2", lookup(&vars)),
            Some("http://secure:8080".to_string())
        );
        assert_eq!(
            select_from_env("ws://host.example.com/v2", lookup(&vars)),
            Some("http://plain:8080".to_string())
        );
    }

    #[test]
    fn test_no_proxy_suffix_match() {
        let vars = env(&[
            ("https_proxy", "http://secure:8080"),
            ("no_proxy", "localhost,.example.com"),
        ]);
        assert_eq!(
            select_from_env("wss://host.example.com/v2", lookup(&vars)),
            None
        );
        assert_eq!(
            select_from_env("wss://localhost:9999/v2", lookup(&vars)),
            None
        );
        assert_eq!(
            select_from_env("wss://other.net/v2", lookup(&vars)),
            Some("http://secure:8080".to_string())
        );
    }

    #[test]
    fn test_no_proxy_wildcard() {
        let vars = env(&[("https_proxy", "http://secure:8080"), ("no_proxy", "*")]);
        assert_eq!(select_from_env("wss://anything/v2", lookup(&vars)), None);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("wss://a.b.c:443/v2?appkey=k"), Some("a.b.c"));
        assert_eq!(host_of("ws://plain/path"), Some("plain"));
        assert_eq!(host_of("no-scheme"), None);
    }
}
