//! Channel naming and the subscription authorization predicate.
//!
//! Channels are access-scoped by prefix. A subscriber may only attach to
//! channels its authenticated identity matches:
//!
//! - `site:<siteId>:…`  - the connection's site
//! - `user:<userId>:…`  - the connection's user
//! - `org:<orgId>:…`    - the connection's organization
//! - `public:…`         - anyone
//!
//! Everything else is denied. There are no wildcard grants.

use crate::auth::Identity;

/// The background fan-out channel for a site's notifications.
#[must_use]
pub fn site_notifications(site_id: &str) -> String {
    format!("notifications:{site_id}")
}

/// Whether `identity` may subscribe to `channel`.
#[must_use]
pub fn authorized(identity: &Identity, channel: &str) -> bool {
    if channel.starts_with("public:") {
        return true;
    }
    channel
        .strip_prefix("site:")
        .and_then(|rest| rest.strip_prefix(identity.site_id.as_str()))
        .is_some_and(|rest| rest.starts_with(':'))
        || channel
            .strip_prefix("user:")
            .and_then(|rest| rest.strip_prefix(identity.user_id.as_str()))
            .is_some_and(|rest| rest.starts_with(':'))
        || channel
            .strip_prefix("org:")
            .and_then(|rest| rest.strip_prefix(identity.org_id.as_str()))
            .is_some_and(|rest| rest.starts_with(':'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            user_id: "u-1".to_string(),
            site_id: "S1".to_string(),
            org_id: "org-1".to_string(),
            role: "viewer".to_string(),
        }
    }

    #[test]
    fn own_scopes_are_allowed() {
        let id = identity();
        assert!(authorized(&id, "site:S1:notifications"));
        assert!(authorized(&id, "user:u-1:inbox"));
        assert!(authorized(&id, "org:org-1:billing"));
        assert!(authorized(&id, "public:announcements"));
    }

    #[test]
    fn foreign_scopes_are_denied() {
        let id = identity();
        assert!(!authorized(&id, "site:S2:notifications"));
        assert!(!authorized(&id, "user:u-2:inbox"));
        assert!(!authorized(&id, "org:org-2:billing"));
    }

    #[test]
    fn prefix_matching_is_exact_not_substring() {
        let id = identity();
        // "S1" must not authorize "S10".
        assert!(!authorized(&id, "site:S10:notifications"));
        assert!(!authorized(&id, "user:u-10:inbox"));
    }

    #[test]
    fn unscoped_channels_are_denied() {
        let id = identity();
        assert!(!authorized(&id, "notifications:S1"));
        assert!(!authorized(&id, "admin:everything"));
        assert!(!authorized(&id, ""));
    }
}
