//! Download requests built from subscription metadata

use lk_core::types::meta_keys;
use lk_core::{Subscription, SubscriptionId};
use url::Url;

use crate::config::AppInfo;

/// Everything the downloader needs to fetch one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub id: SubscriptionId,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub allow_metered: bool,
    pub download_only: bool,
}

impl DownloadRequest {
    /// Build the request for a remote subscription; `None` for local ones.
    pub fn for_subscription(sub: &Subscription, app: &AppInfo, allow_metered: bool) -> Option<Self> {
        let mut url = sub.url()?.clone();

        let download_count = sub.download_count();
        let download_count = if download_count < 5 {
            download_count.to_string()
        } else {
            "4+".to_string()
        };

        url.query_pairs_mut()
            .append_pair("addonName", &app.addon_name)
            .append_pair("addonVersion", &app.addon_version)
            .append_pair("application", &app.application)
            .append_pair("applicationVersion", &app.application_version)
            .append_pair("platform", &app.platform)
            .append_pair("platformVersion", &app.platform_version)
            .append_pair("lastVersion", &sub.version().to_string())
            .append_pair("downloadCount", &download_count);

        // Conditional headers are only safe when the local copy is intact.
        let mut headers = Vec::new();
        if sub.is_metadata_valid() && sub.is_filters_valid() {
            if let Some(last_modified) = sub.meta(meta_keys::HTTP_LAST_MODIFIED) {
                headers.push(("If-Modified-Since".to_string(), last_modified.to_string()));
            }
            if let Some(etag) = sub.meta(meta_keys::HTTP_ETAG) {
                headers.push(("If-None-Match".to_string(), etag.to_string()));
            }
        }

        Some(Self {
            id: sub.id().clone(),
            url,
            headers,
            allow_metered,
            download_only: sub.is_download_only(),
        })
    }
}
