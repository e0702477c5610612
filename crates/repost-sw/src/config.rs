//! Worker configuration.
//!
//! Every cache name, the precache manifest and the routing constants live in
//! one immutable [`WorkerConfig`]. Bumping a [`CacheGeneration`] version is the
//! only way to invalidate a cache class: the old generation is deleted
//! wholesale on the next activation.

use std::fmt;
use std::path::Path;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{SwError, SwResult};

/// A versioned cache name, rendered as `<prefix>-v<version>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGeneration {
    pub prefix: String,
    pub version: u32,
}

impl CacheGeneration {
    pub fn new(prefix: impl Into<String>, version: u32) -> Self {
        Self {
            prefix: prefix.into(),
            version,
        }
    }

    /// The cache name this generation is stored under.
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// The next generation of the same cache class.
    pub fn bumped(&self) -> Self {
        Self::new(self.prefix.clone(), self.version + 1)
    }
}

impl fmt::Display for CacheGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.prefix, self.version)
    }
}

/// Settings for notifications built from push messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Title used when the payload has none.
    pub default_title: String,
    /// Body used when the payload has none.
    pub default_body: String,
    pub icon: String,
    pub badge: String,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
    /// Where the `explore` action leads when the payload has no URL.
    pub default_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_title: "Repost".to_string(),
            default_body: "You have a new update".to_string(),
            icon: "/icon-192.png".to_string(),
            badge: "/icon-192.png".to_string(),
            vibrate: vec![100, 50, 100],
            default_url: "/dashboard".to_string(),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the dashboard is served from.
    pub origin: Url,

    /// App-shell generation (offline fallback page).
    pub shell_cache: CacheGeneration,

    /// API response generation.
    pub api_cache: CacheGeneration,

    /// Static asset generation (precache manifest and lazily cached assets).
    pub static_cache: CacheGeneration,

    /// Paths fetched into the static generation at install time.
    pub precache_urls: Vec<String>,

    /// Page served to offline navigations that miss the cache.
    pub offline_page: String,

    /// Path that receives share-target POSTs.
    pub share_target_path: String,

    /// Where share-target POSTs are redirected (a `shared=true` marker is added).
    pub share_redirect_path: String,

    /// Host suffixes of the backend data service.
    pub api_hosts: Vec<String>,

    /// Path fragment that marks same-origin API calls.
    pub api_path_segment: String,

    /// Refresh a static cache hit from the network after serving it.
    pub refresh_static_in_background: bool,

    /// Ask to be activated as soon as install finishes.
    pub skip_waiting_on_install: bool,

    pub notifications: NotificationConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:8080/").expect("static origin is valid"),
            shell_cache: CacheGeneration::new("repost", 1),
            api_cache: CacheGeneration::new("repost-api", 1),
            static_cache: CacheGeneration::new("repost-static", 1),
            precache_urls: [
                "/",
                "/dashboard",
                "/dashboard/content",
                "/dashboard/schedule",
                "/dashboard/analytics",
                "/offline.html",
                "/manifest.json",
                "/icon-192.png",
                "/icon-512.png",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            offline_page: "/offline.html".to_string(),
            share_target_path: "/dashboard/content".to_string(),
            share_redirect_path: "/dashboard/content".to_string(),
            api_hosts: vec!["supabase.co".to_string()],
            api_path_segment: "/api/".to_string(),
            refresh_static_in_background: false,
            skip_waiting_on_install: true,
            notifications: NotificationConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Default configuration for a dashboard served from `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json(json: &str) -> SwResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> SwResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> SwResult<()> {
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(SwError::Config(format!(
                "origin must be http or https, got {}",
                self.origin
            )));
        }

        let names = self.cache_names();
        let distinct: HashSet<&String> = names.iter().collect();
        if distinct.len() != names.len() {
            return Err(SwError::Config(format!(
                "cache generations must have distinct names: {names:?}"
            )));
        }

        let paths = self
            .precache_urls
            .iter()
            .chain([
                &self.offline_page,
                &self.share_target_path,
                &self.share_redirect_path,
                &self.notifications.default_url,
            ]);
        for path in paths {
            if !path.starts_with('/') {
                return Err(SwError::Config(format!(
                    "path '{path}' must be absolute (start with '/')"
                )));
            }
        }

        Ok(())
    }

    /// Names of the current generations; everything else is garbage at activation.
    pub fn cache_names(&self) -> [String; 3] {
        [
            self.shell_cache.name(),
            self.api_cache.name(),
            self.static_cache.name(),
        ]
    }

    pub fn is_current_cache(&self, name: &str) -> bool {
        self.cache_names().iter().any(|n| n == name)
    }

    /// Resolve an app path against the origin.
    pub fn resolve(&self, path: &str) -> SwResult<Url> {
        Ok(self.origin.join(path)?)
    }

    pub fn offline_page_url(&self) -> SwResult<Url> {
        self.resolve(&self.offline_page)
    }

    /// Redirect target for share-target POSTs.
    pub fn share_redirect_url(&self, shared: bool) -> SwResult<Url> {
        let mut url = self.resolve(&self.share_redirect_path)?;
        if shared {
            url.query_pairs_mut().append_pair("shared", "true");
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cache_names() {
        let config = WorkerConfig::default();
        assert_eq!(
            config.cache_names(),
            [
                "repost-v1".to_string(),
                "repost-api-v1".to_string(),
                "repost-static-v1".to_string()
            ]
        );
        assert!(config.is_current_cache("repost-api-v1"));
        assert!(!config.is_current_cache("repost-api-v0"));
    }

    #[test]
    fn test_generation_bump() {
        let generation = CacheGeneration::new("repost-static", 3);
        assert_eq!(generation.bumped().name(), "repost-static-v4");
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = WorkerConfig::from_json(
            r#"{
                "origin": "https://app.repost.example/",
                "api_cache": { "prefix": "repost-api", "version": 7 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.origin.as_str(), "https://app.repost.example/");
        assert_eq!(config.api_cache.name(), "repost-api-v7");
        assert_eq!(config.static_cache.name(), "repost-static-v1");
        assert_eq!(config.notifications.vibrate, vec![100, 50, 100]);
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = WorkerConfig::default();
        config.api_cache = config.static_cache.clone();
        assert!(matches!(config.validate(), Err(SwError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_relative_paths() {
        let mut config = WorkerConfig::default();
        config.precache_urls.push("dashboard".to_string());
        assert!(matches!(config.validate(), Err(SwError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_non_http_origin() {
        let json = r#"{ "origin": "file:///srv/app/" }"#;
        assert!(matches!(WorkerConfig::from_json(json), Err(SwError::Config(_))));
    }

    #[test]
    fn test_share_redirect_url() {
        let config = WorkerConfig::for_origin(Url::parse("https://app.example/").unwrap());
        assert_eq!(
            config.share_redirect_url(true).unwrap().as_str(),
            "https://app.example/dashboard/content?shared=true"
        );
        assert_eq!(
            config.share_redirect_url(false).unwrap().as_str(),
            "https://app.example/dashboard/content"
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, r#"{ "offline_page": "/offline-v2.html" }"#).unwrap();

        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.offline_page, "/offline-v2.html");
    }
}
