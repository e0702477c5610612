//! Request classification.
//!
//! Every intercepted request is assigned exactly one [`RequestClass`]. Rules
//! are checked in order and the first match wins; the order matters because
//! the URL patterns overlap.

use http::Method;
use repost_net::{Request, RequestMode};
use tracing::trace;

use crate::config::WorkerConfig;

/// Routing policy selected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Backend data calls: network first, cached copy when offline.
    Api,
    /// Page loads: network, then cache, then the offline page.
    Navigation,
    /// Everything else: cache first.
    Static,
    /// POST from the OS share sheet.
    ShareTarget,
    /// Not intercepted; goes to the network untouched.
    Ignored,
}

/// Pick the routing policy for `request`.
pub fn classify(request: &Request, config: &WorkerConfig) -> RequestClass {
    let class = classify_inner(request, config);
    trace!(url = %request.url, method = %request.method, ?class, "Classified request");
    class
}

fn classify_inner(request: &Request, config: &WorkerConfig) -> RequestClass {
    let url = &request.url;

    // Extension and data: URLs cannot be stored.
    if !matches!(url.scheme(), "http" | "https") {
        return RequestClass::Ignored;
    }

    if request.method != Method::GET {
        let is_share = request.method == Method::POST
            && request.is_same_origin(&config.origin)
            && url.path() == config.share_target_path;
        return if is_share {
            RequestClass::ShareTarget
        } else {
            RequestClass::Ignored
        };
    }

    if is_api(request, config) {
        return RequestClass::Api;
    }

    if request.mode == RequestMode::Navigate {
        return RequestClass::Navigation;
    }

    RequestClass::Static
}

fn is_api(request: &Request, config: &WorkerConfig) -> bool {
    let host_matches = request.url.host_str().is_some_and(|host| {
        config
            .api_hosts
            .iter()
            .any(|suffix| host == suffix || host.ends_with(&format!(".{suffix}")))
    });

    host_matches
        || (!config.api_path_segment.is_empty()
            && request.url.path().contains(&config.api_path_segment))
}
