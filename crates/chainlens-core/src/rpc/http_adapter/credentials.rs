//! Endpoint and credential resolution for the node connection.

use std::path::Path;

use reqwest::Url;

use crate::error::CoreError;

/// HTTP basic-auth pair attached to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Credentials {
    pub(super) user: String,
    pub(super) password: String,
}

impl Credentials {
    /// Explicit `user`/`pass` take precedence over the cookie file. Neither
    /// means the node is reached without authentication.
    pub(super) fn resolve(
        user: Option<&str>,
        pass: Option<&str>,
        cookie_file: Option<&Path>,
    ) -> Result<Option<Self>, CoreError> {
        match (user, pass, cookie_file) {
            (Some(user), Some(password), _) => Ok(Some(Self {
                user: user.to_owned(),
                password: password.to_owned(),
            })),
            (Some(_), None, _) | (None, Some(_), _) => Err(CoreError::Config(
                "rpc user and rpc pass must be given together".to_owned(),
            )),
            (None, None, Some(path)) => Self::from_cookie_file(path).map(Some),
            (None, None, None) => Ok(None),
        }
    }

    fn from_cookie_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read rpc cookie {}: {e}", path.display()))
        })?;
        Self::parse_cookie(&content).ok_or_else(|| {
            CoreError::Config(format!(
                "rpc cookie {} must hold a non-empty `user:password` line",
                path.display()
            ))
        })
    }

    /// bitcoind writes `__cookie__:<hex>` on a single line.
    fn parse_cookie(content: &str) -> Option<Self> {
        let (user, password) = content.lines().next()?.trim().split_once(':')?;
        if user.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            user: user.to_owned(),
            password: password.to_owned(),
        })
    }
}

/// Validate the node URL. Only plain and TLS HTTP are spoken.
pub(super) fn endpoint_url(raw: &str) -> Result<Url, CoreError> {
    let url = Url::parse(raw)
        .map_err(|e| CoreError::Config(format!("rpc url `{raw}` is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CoreError::Config(format!(
            "rpc url `{raw}` uses scheme `{}`; only http and https are supported",
            url.scheme()
        )));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_accepts_http_and_https_only() {
        assert!(endpoint_url("http://127.0.0.1:18443").is_ok());
        assert!(endpoint_url("https://node.example:8332/wallet/x").is_ok());

        let err = endpoint_url("tcp://127.0.0.1:8332").expect_err("tcp is not http");
        assert!(err.to_string().contains("only http and https"));
        assert!(endpoint_url("127.0.0.1:8332").is_err());
    }

    #[test]
    fn explicit_pair_wins_over_cookie() {
        let missing = Path::new("/nonexistent/chainlens/.cookie");
        let creds = Credentials::resolve(Some("rpc"), Some("hunter2"), Some(missing))
            .expect("explicit pair must not touch the cookie")
            .expect("credentials present");
        assert_eq!(creds.user, "rpc");
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn half_a_pair_is_a_config_error() {
        let err = Credentials::resolve(None, Some("hunter2"), None).expect_err("must fail");
        assert!(matches!(err, CoreError::Config(_)));
        assert_eq!(Credentials::resolve(None, None, None).expect("no auth"), None);
    }

    #[test]
    fn cookie_lines_split_on_first_colon() {
        let creds = Credentials::parse_cookie("__cookie__:ab:cd\n").expect("cookie parses");
        assert_eq!(creds.user, "__cookie__");
        assert_eq!(creds.password, "ab:cd");

        assert!(Credentials::parse_cookie("").is_none());
        assert!(Credentials::parse_cookie("__cookie__:").is_none());
        assert!(Credentials::parse_cookie("no-separator").is_none());
    }

    #[test]
    fn unreadable_cookie_file_is_reported() {
        let err = Credentials::resolve(None, None, Some(Path::new("/nonexistent/chainlens/.cookie")))
            .expect_err("missing cookie must fail");
        assert!(err.to_string().contains("cannot read rpc cookie"));
    }
}
