//! Environment-driven configuration.
//!
//! All topology and secrets come from the environment; missing required
//! values fail startup (exit code 1) with the variable named in the
//! error. Provider webhook secrets default to the shared
//! `WEBHOOK_SECRET` unless a provider-specific override is set.

use thiserror::Error;

/// Configuration errors surfaced at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    /// A variable is set but unparseable.
    #[error("Invalid value for {name}: {reason}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// What was wrong.
        reason: String,
    },
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Service name for logs and health payloads.
    pub service_name: String,
    /// HTTP listen port.
    pub port: u16,
    /// Kafka bootstrap brokers.
    pub brokers: String,
    /// Bus client id.
    pub client_id: String,
    /// Consumer group id.
    pub group_id: String,
    /// Redis URL for queues and pub/sub.
    pub pubsub_url: String,
    /// Postgres URL for the event store.
    pub database_url: String,
    /// Broker JWT secret.
    pub jwt_secret: String,
    /// Expected JWT issuer.
    pub jwt_issuer: Option<String>,
    /// Expected JWT audience.
    pub jwt_audience: Option<String>,
    /// Secret for service-to-service tokens.
    pub service_jwt_secret: Option<String>,
    /// Shopify webhook secret.
    pub shopify_secret: String,
    /// WooCommerce webhook secret.
    pub woocommerce_secret: String,
    /// Stripe endpoint secret.
    pub stripe_secret: String,
    /// Log filter (tracing `EnvFilter` syntax).
    pub log_level: String,
    /// Optional single-tenant shop seeded into the static directory.
    pub seed_shop: Option<SeedShop>,
}

/// A shop-domain mapping seeded from the environment (single-tenant and
/// development deployments; multi-tenant installs plug a real directory).
#[derive(Debug, Clone)]
pub struct SeedShop {
    /// Provider shop domain.
    pub shop_domain: String,
    /// Our organization id.
    pub organization_id: String,
    /// Our site id.
    pub site_id: String,
}

impl ServerConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing or malformed variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary lookup (tests inject maps here).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing or malformed variables.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| -> Result<String, ConfigError> {
            match get(name) {
                Some(value) if !value.is_empty() => Ok(value),
                _ => Err(ConfigError::Missing(name)),
            }
        };
        let optional = |name: &str| get(name).filter(|value| !value.is_empty());

        let webhook_secret = required("WEBHOOK_SECRET")?;
        let port = match optional("PORT") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
                name: "PORT",
                reason: format!("{e}"),
            })?,
            None => 8080,
        };

        Ok(Self {
            service_name: optional("SERVICE_NAME").unwrap_or_else(|| "proofpulse".to_string()),
            port,
            brokers: required("BROKERS")?,
            client_id: optional("CLIENT_ID").unwrap_or_else(|| "proofpulse".to_string()),
            group_id: optional("GROUP_ID")
                .unwrap_or_else(|| "proofpulse-materializer".to_string()),
            pubsub_url: required("PUBSUB_URL")?,
            database_url: required("DATABASE_URL")?,
            jwt_secret: required("JWT_SECRET")?,
            jwt_issuer: optional("JWT_ISSUER"),
            jwt_audience: optional("JWT_AUDIENCE"),
            service_jwt_secret: optional("SERVICE_JWT_SECRET"),
            shopify_secret: optional("SHOPIFY_WEBHOOK_SECRET")
                .unwrap_or_else(|| webhook_secret.clone()),
            woocommerce_secret: optional("WOOCOMMERCE_WEBHOOK_SECRET")
                .unwrap_or_else(|| webhook_secret.clone()),
            stripe_secret: optional("STRIPE_WEBHOOK_SECRET").unwrap_or(webhook_secret),
            log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            seed_shop: match (
                optional("SHOP_DOMAIN"),
                optional("ORGANIZATION_ID"),
                optional("SITE_ID"),
            ) {
                (Some(shop_domain), Some(organization_id), Some(site_id)) => Some(SeedShop {
                    shop_domain,
                    organization_id,
                    site_id,
                }),
                _ => None,
            },
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("BROKERS", "localhost:9092"),
            ("PUBSUB_URL", "redis://localhost:6379"),
            ("DATABASE_URL", "postgres://localhost/proofpulse"),
            ("JWT_SECRET", "jwt-secret"),
            ("WEBHOOK_SECRET", "hook-secret"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<ServerConfig, ConfigError> {
        ServerConfig::from_lookup(|name| env.get(name).map(ToString::to_string))
    }

    #[test]
    fn minimal_env_loads_with_defaults() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.client_id, "proofpulse");
        assert_eq!(config.group_id, "proofpulse-materializer");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.shopify_secret, "hook-secret");
    }

    #[test]
    fn missing_required_variable_is_named() {
        let mut env = base_env();
        env.remove("BROKERS");
        match load(&env) {
            Err(ConfigError::Missing(name)) => assert_eq!(name, "BROKERS"),
            other => panic!("expected missing BROKERS, got {other:?}"),
        }
    }

    #[test]
    fn provider_secrets_override_the_shared_one() {
        let mut env = base_env();
        env.insert("SHOPIFY_WEBHOOK_SECRET", "shopify-only");
        let config = load(&env).unwrap();
        assert_eq!(config.shopify_secret, "shopify-only");
        assert_eq!(config.woocommerce_secret, "hook-secret");
    }

    #[test]
    fn bad_port_is_rejected() {
        let mut env = base_env();
        env.insert("PORT", "not-a-port");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Invalid { name: "PORT", .. })
        ));
    }

    #[test]
    fn seed_shop_requires_all_three_variables() {
        let mut env = base_env();
        env.insert("SHOP_DOMAIN", "shop.myshopify.com");
        assert!(load(&env).unwrap().seed_shop.is_none());

        env.insert("ORGANIZATION_ID", "org-1");
        env.insert("SITE_ID", "site-1");
        let seed = load(&env).unwrap().seed_shop.unwrap();
        assert_eq!(seed.shop_domain, "shop.myshopify.com");
        assert_eq!(seed.site_id, "site-1");
    }

    #[test]
    fn empty_values_count_as_missing() {
        let mut env = base_env();
        env.insert("JWT_SECRET", "");
        assert!(matches!(load(&env), Err(ConfigError::Missing("JWT_SECRET"))));
    }
}
