//! Credential sources

use super::SessionError;
use crate::Platform;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

/// Environment variable prefix read by [`EnvCredentials`]
pub const ENV_PREFIX: &str = "MULTISCRAPE";

/// Secret bundle for one platform (usernames, passwords, tokens, cookies)
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    values: BTreeMap<String, String>,
}

impl Credentials {
    /// Empty bundle
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Look up a secret
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the bundle has no entries
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// Secrets never reach log output.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Where platform secrets come from
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Secrets for `platform`, or `None` for anonymous access
    async fn get_credentials(&self, platform: Platform)
        -> Result<Option<Credentials>, SessionError>;
}

/// In-memory credentials, mostly for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    by_platform: HashMap<Platform, Credentials>,
}

impl StaticCredentials {
    /// No credentials for any platform
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the credentials for one platform
    pub fn with(mut self, platform: Platform, credentials: Credentials) -> Self {
        self.by_platform.insert(platform, credentials);
        self
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn get_credentials(
        &self,
        platform: Platform,
    ) -> Result<Option<Credentials>, SessionError> {
        Ok(self.by_platform.get(&platform).cloned())
    }
}

/// Credentials read from `MULTISCRAPE_<PLATFORM>_<KEY>` environment variables
///
/// `MULTISCRAPE_TWITTER_USERNAME=alice` yields key `username` for twitter.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    prefix: String,
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvCredentials {
    /// Read variables under the default prefix
    pub fn new() -> Self {
        Self::with_prefix(ENV_PREFIX)
    }

    /// Read variables under a custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn collect<I>(&self, platform: Platform, vars: I) -> Option<Credentials>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let wanted = format!(
            "{}_{}_",
            self.prefix.to_ascii_uppercase(),
            platform.as_str().to_ascii_uppercase()
        );
        let credentials = vars
            .into_iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(&wanted)
                    .filter(|key| !key.is_empty())
                    .map(|key| (key.to_ascii_lowercase(), value))
            })
            .fold(Credentials::new(), |acc, (k, v)| acc.with(k, v));

        (!credentials.is_empty()).then_some(credentials)
    }
}

#[async_trait]
impl CredentialSource for EnvCredentials {
    async fn get_credentials(
        &self,
        platform: Platform,
    ) -> Result<Option<Credentials>, SessionError> {
        Ok(self.collect(platform, std::env::vars()))
    }
}
