//! Outbound identity profiles

use serde::{Deserialize, Serialize};

/// Browser identity presented to a site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintProfile {
    /// `User-Agent` header
    pub user_agent: String,
    /// Viewport width in CSS pixels
    pub viewport_width: u32,
    /// Viewport height in CSS pixels
    pub viewport_height: u32,
    /// `Accept-Language` header
    pub accept_language: String,
    /// IANA timezone reported by the browser
    pub timezone: String,
}

impl FingerprintProfile {
    fn desktop(user_agent: &str, (width, height): (u32, u32), lang: &str, tz: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            viewport_width: width,
            viewport_height: height,
            accept_language: lang.to_string(),
            timezone: tz.to_string(),
        }
    }
}

/// Built-in pool of common desktop profiles
pub fn default_pool() -> Vec<FingerprintProfile> {
    vec![
        FingerprintProfile::desktop(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
            (1920, 1080),
            "en-US,en;q=0.9",
            "America/New_York",
        ),
        FingerprintProfile::desktop(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
            (1440, 900),
            "en-US,en;q=0.8",
            "America/Los_Angeles",
        ),
        FingerprintProfile::desktop(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:122.0) Gecko/20100101 Firefox/122.0",
            (1366, 768),
            "en-GB,en;q=0.7",
            "Europe/London",
        ),
        FingerprintProfile::desktop(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
            (1536, 864),
            "en-US,en;q=0.9",
            "America/Chicago",
        ),
        FingerprintProfile::desktop(
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
            (1920, 1080),
            "en-US,en;q=0.9",
            "UTC",
        ),
    ]
}
