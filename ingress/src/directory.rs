//! Shop-domain to tenant resolution.
//!
//! The mapping between provider shop domains and our organization/site ids
//! lives outside this system (admin surface, relational store). Ingress
//! only needs a lookup, so the seam is a small trait; the bundled static
//! implementation serves tests and single-tenant deployments.

use crate::provider::Tenant;
use std::collections::HashMap;

/// Resolves a provider shop domain to a tenant.
///
/// Lookups sit on the webhook hot path and are expected to be served from
/// memory or a warm cache.
pub trait ShopDirectory: Send + Sync {
    /// Resolve a shop domain; `None` when the shop is not installed.
    fn resolve(&self, shop_domain: &str) -> Option<Tenant>;
}

/// Fixed in-memory directory.
#[derive(Default)]
pub struct StaticShopDirectory {
    shops: HashMap<String, Tenant>,
}

impl StaticShopDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shop.
    #[must_use]
    pub fn with_shop(
        mut self,
        shop_domain: impl Into<String>,
        organization_id: impl Into<String>,
        site_id: impl Into<String>,
    ) -> Self {
        let shop_domain = shop_domain.into();
        self.shops.insert(
            shop_domain.clone(),
            Tenant {
                shop_domain,
                organization_id: organization_id.into(),
                site_id: site_id.into(),
            },
        );
        self
    }
}

impl ShopDirectory for StaticShopDirectory {
    fn resolve(&self, shop_domain: &str) -> Option<Tenant> {
        self.shops.get(shop_domain).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_registered_shops_only() {
        let directory = StaticShopDirectory::new()
            .with_shop("shop.myshopify.com", "org-1", "site-1");

        let tenant = directory.resolve("shop.myshopify.com");
        assert_eq!(tenant.map(|t| t.site_id), Some("site-1".to_string()));
        assert!(directory.resolve("other.myshopify.com").is_none());
    }
}
