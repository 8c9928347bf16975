//! Azure resource ID helpers.

use std::sync::LazyLock;

use regex::Regex;

static SUBSCRIPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^/subscriptions/([^/]+)(?:/|$)").unwrap());

static RESOURCE_GROUP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/resourceGroups/([^/]+)(?:/|$)").unwrap());

/// Subscription ID segment of a resource ID.
pub fn subscription_of(resource_id: &str) -> Option<String> {
    SUBSCRIPTION_RE
        .captures(resource_id.trim())
        .map(|c| c[1].to_string())
}

/// Resource group segment of a resource ID.
pub fn resource_group_of(resource_id: &str) -> Option<String> {
    RESOURCE_GROUP_RE
        .captures(resource_id.trim())
        .map(|c| c[1].to_string())
}

/// Canonical comparison key. Azure resource IDs are case-insensitive.
pub fn normalize(resource_id: &str) -> String {
    resource_id.trim().trim_end_matches('/').to_ascii_lowercase()
}
