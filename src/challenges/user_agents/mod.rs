//! Browser header profiles.
//!
//! Responsibilities:
//! - Provide navigation headers for plain page loads and credential probes.
//! - Provide the fetch metadata headers a browser sends when the challenge
//!   page script navigates to the pass-challenge endpoint.
//! - Allow a custom User-Agent while keeping the rest of the profile coherent.

use http::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderName, HeaderValue, REFERER, USER_AGENT};
use rand::seq::SliceRandom;
use rand::thread_rng;
use thiserror::Error;

const CHROME_131_LINUX: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const CHROME_131_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const CHROME_131_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

const CHROME_131_BRANDS: &str =
    r#""Google Chrome";v="131", "Chromium";v="131", "Not_A Brand";v="24""#;

const NAVIGATION_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const SUBMISSION_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

/// A coherent set of browser identity headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub accept_language: String,
    /// `Sec-CH-UA` brand list, absent for browsers that do not send client hints.
    pub sec_ch_ua: Option<String>,
    pub platform: String,
}

static PROFILES: &[(&str, &str)] = &[
    (CHROME_131_LINUX, "\"Linux\""),
    (CHROME_131_WINDOWS, "\"Windows\""),
    (CHROME_131_MAC, "\"macOS\""),
];

impl BrowserProfile {
    /// Chrome 131 on desktop Linux.
    pub fn chrome_linux() -> Self {
        Self::chrome(CHROME_131_LINUX, "\"Linux\"")
    }

    /// One of the built-in desktop Chrome profiles, chosen at random.
    pub fn random_desktop() -> Self {
        let mut rng = thread_rng();
        let (ua, platform) = PROFILES
            .choose(&mut rng)
            .copied()
            .unwrap_or((CHROME_131_LINUX, "\"Linux\""));
        Self::chrome(ua, platform)
    }

    /// Profile with a caller-supplied User-Agent; client hints are dropped
    /// unless the agent claims to be Chrome.
    pub fn custom(user_agent: impl Into<String>) -> Result<Self, UserAgentError> {
        let user_agent = user_agent.into();
        if user_agent.trim().is_empty() {
            return Err(UserAgentError::Empty);
        }
        HeaderValue::from_str(&user_agent).map_err(|_| UserAgentError::InvalidHeader)?;

        let mut profile = Self::chrome_linux();
        if !user_agent.contains("Chrome/") {
            profile.sec_ch_ua = None;
        }
        profile.user_agent = user_agent;
        Ok(profile)
    }

    fn chrome(user_agent: &str, platform: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
            sec_ch_ua: Some(CHROME_131_BRANDS.to_string()),
            platform: platform.to_string(),
        }
    }

    /// Headers for a top-level page load or credential probe.
    pub fn navigation_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert(&mut headers, USER_AGENT, &self.user_agent);
        insert(&mut headers, ACCEPT, NAVIGATION_ACCEPT);
        insert(&mut headers, ACCEPT_LANGUAGE, &self.accept_language);
        headers
    }

    /// Headers for the pass-challenge navigation issued from `referer`.
    pub fn submission_headers(&self, referer: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert(&mut headers, USER_AGENT, &self.user_agent);
        insert(&mut headers, ACCEPT, SUBMISSION_ACCEPT);
        insert(&mut headers, ACCEPT_LANGUAGE, &self.accept_language);
        insert(&mut headers, REFERER, referer);
        if let Some(ref brands) = self.sec_ch_ua {
            insert(&mut headers, HeaderName::from_static("sec-ch-ua"), brands);
            insert(&mut headers, HeaderName::from_static("sec-ch-ua-mobile"), "?0");
            insert(
                &mut headers,
                HeaderName::from_static("sec-ch-ua-platform"),
                &self.platform,
            );
        }
        insert(&mut headers, HeaderName::from_static("sec-fetch-dest"), "document");
        insert(&mut headers, HeaderName::from_static("sec-fetch-mode"), "navigate");
        insert(&mut headers, HeaderName::from_static("sec-fetch-site"), "same-origin");
        insert(&mut headers, HeaderName::from_static("sec-fetch-user"), "?1");
        insert(
            &mut headers,
            HeaderName::from_static("upgrade-insecure-requests"),
            "1",
        );
        headers
    }
}

impl Default for BrowserProfile {
    fn default() -> Self {
        Self::chrome_linux()
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => log::debug!("skipping non-ascii value for header {name}"),
    }
}

#[derive(Debug, Error)]
pub enum UserAgentError {
    #[error("user agent must not be empty")]
    Empty,
    #[error("user agent is not a valid header value")]
    InvalidHeader,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_headers_mimic_navigation_from_challenge_page() {
        let headers =
            BrowserProfile::chrome_linux().submission_headers("https://mirror.example/search");
        assert_eq!(headers.get(REFERER).unwrap(), "https://mirror.example/search");
        assert_eq!(headers.get("sec-fetch-mode").unwrap(), "navigate");
        assert!(headers.get("sec-ch-ua").unwrap().to_str().unwrap().contains("131"));
        assert!(headers.get(USER_AGENT).unwrap().to_str().unwrap().contains("X11; Linux"));
    }

    #[test]
    fn custom_non_chrome_agent_drops_client_hints() {
        let profile = BrowserProfile::custom("Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0").unwrap();
        let headers = profile.submission_headers("https://mirror.example/");
        assert!(headers.get("sec-ch-ua").is_none());
        assert!(headers.get("sec-fetch-site").is_some());
    }

    #[test]
    fn rejects_empty_custom_agent() {
        assert!(matches!(BrowserProfile::custom("  "), Err(UserAgentError::Empty)));
    }

    #[test]
    fn random_profile_is_chrome() {
        let profile = BrowserProfile::random_desktop();
        assert!(profile.user_agent.contains("Chrome/131"));
        assert_eq!(profile.navigation_headers().get(ACCEPT_LANGUAGE).unwrap(), "en-US,en;q=0.5");
    }
}
