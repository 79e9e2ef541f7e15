//! Schema registry and versioner for event payloads.
//!
//! Each event kind carries a semver'd JSON Schema describing the shape of
//! its `data` field. The registry validates incoming events against the
//! schema for their declared version and, when the declared version is older
//! than the latest registered one, walks the migration path forward so
//! consumers only ever see the newest shape.
//!
//! # Migrations
//!
//! Migrations form a directed graph per event type. Each registered schema
//! may declare a `migration_path` - the ordered list of versions to walk
//! through - and each hop is a typed transform over the raw `data` value.
//! Transforms must be total on valid inputs of their source version.
//!
//! # Example
//!
//! ```
//! use proofpulse_core::event::Event;
//! use proofpulse_core::schema::SchemaRegistry;
//! use serde_json::json;
//!
//! let registry = SchemaRegistry::with_builtins();
//!
//! // A v1.0.0 registration without a timezone...
//! let event = Event::new(
//!     "user.registered",
//!     "1.0.0",
//!     "web",
//!     "org-1",
//!     json!({ "userId": "u-1", "email": "a@example.com" }),
//! );
//!
//! // ...is migrated forward to v1.1.0 with the UTC default applied.
//! let outcome = registry.validate(&event);
//! assert!(outcome.valid);
//! let migrated = outcome.migrated_event.unwrap();
//! assert_eq!(migrated.version, "1.1.0");
//! assert_eq!(migrated.data["timezone"], "UTC");
//! ```

use crate::event::Event;
use jsonschema::JSONSchema;
use semver::Version;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the schema registry.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// The version string is not valid semver.
    #[error("Invalid semver version '{version}': {reason}")]
    InvalidVersion {
        /// The offending version string.
        version: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// The schema document itself failed to compile.
    #[error("Invalid schema for {event_type}@{version}: {reason}")]
    InvalidSchema {
        /// Event type being registered.
        event_type: String,
        /// Version being registered.
        version: String,
        /// Compiler diagnostic.
        reason: String,
    },

    /// A migration transform failed.
    #[error("Migration {event_type} {from} -> {to} failed: {reason}")]
    MigrationFailed {
        /// Event type being migrated.
        event_type: String,
        /// Source version.
        from: Version,
        /// Target version.
        to: Version,
        /// Transform diagnostic.
        reason: String,
    },
}

/// A migration transform over the raw `data` value.
///
/// Transforms take ownership of the payload and return the payload shaped
/// for the target version.
pub type MigrationFn =
    dyn Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync;

/// Options supplied at schema registration time.
#[derive(Debug, Clone, Default)]
pub struct SchemaOptions {
    /// Deprecated versions are skipped when resolving the latest version.
    pub deprecated: bool,
    /// Ordered versions to walk through when migrating off this version.
    pub migration_path: Vec<Version>,
}

struct RegisteredSchema {
    compiled: JSONSchema,
    deprecated: bool,
    migration_path: Vec<Version>,
}

/// Outcome of validating (and possibly migrating) an event.
#[derive(Debug, Default)]
pub struct Validation {
    /// Whether the event (after any migration) satisfies its schema.
    pub valid: bool,
    /// Human-readable validation errors, empty when valid.
    pub errors: Vec<String>,
    /// The migrated event, present only when a migration was applied.
    pub migrated_event: Option<Event>,
}

impl Validation {
    /// Whether a migration was applied.
    #[must_use]
    pub const fn migrated(&self) -> bool {
        self.migrated_event.is_some()
    }

    fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![error.into()],
            migrated_event: None,
        }
    }
}

/// Registry of event payload schemas and their migration graph.
///
/// The registry is populated at startup (see [`SchemaRegistry::with_builtins`])
/// and shared read-only behind an `Arc` afterwards; registration is not
/// thread-safe by design.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, BTreeMap<Version, RegisteredSchema>>,
    migrations: HashMap<String, HashMap<(Version, Version), Arc<MigrationFn>>>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-loaded with the commerce event schemas the
    /// pipeline ships with (`order.created`, `user.registered` v1.0.0 and
    /// v1.1.0 with its timezone migration, `signup.completed`).
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtin_schemas();
        registry
    }

    /// Register a schema for an event type + version.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidVersion`] for malformed semver and
    /// [`SchemaError::InvalidSchema`] when the document fails to compile.
    pub fn register(
        &mut self,
        event_type: &str,
        version: &str,
        schema: &serde_json::Value,
        options: SchemaOptions,
    ) -> Result<(), SchemaError> {
        let parsed = parse_version(version)?;
        let compiled =
            JSONSchema::compile(schema).map_err(|e| SchemaError::InvalidSchema {
                event_type: event_type.to_string(),
                version: version.to_string(),
                reason: e.to_string(),
            })?;

        self.schemas.entry(event_type.to_string()).or_default().insert(
            parsed,
            RegisteredSchema {
                compiled,
                deprecated: options.deprecated,
                migration_path: options.migration_path,
            },
        );

        tracing::debug!(
            event_type = event_type,
            version = version,
            deprecated = options.deprecated,
            "Registered event schema"
        );

        Ok(())
    }

    /// Register a migration transform between two versions of an event type.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidVersion`] for malformed semver.
    pub fn register_migration<F>(
        &mut self,
        event_type: &str,
        from: &str,
        to: &str,
        transform: F,
    ) -> Result<(), SchemaError>
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        let from = parse_version(from)?;
        let to = parse_version(to)?;
        self.migrations
            .entry(event_type.to_string())
            .or_default()
            .insert((from, to), Arc::new(transform));
        Ok(())
    }

    /// The highest non-deprecated version registered for an event type.
    ///
    /// Falls back to the highest version overall when every registered
    /// version is deprecated, and returns `None` for unknown types.
    #[must_use]
    pub fn latest_version(&self, event_type: &str) -> Option<Version> {
        let versions = self.schemas.get(event_type)?;
        versions
            .iter()
            .rev()
            .find(|(_, schema)| !schema.deprecated)
            .or_else(|| versions.iter().next_back())
            .map(|(version, _)| version.clone())
    }

    /// Validate an event against its declared schema version, migrating
    /// forward to the latest version when a path exists.
    ///
    /// Unknown types, unknown versions without a migration path, and
    /// transform failures all come back as invalid with an explanatory
    /// error; validation never panics or raises.
    #[must_use]
    pub fn validate(&self, event: &Event) -> Validation {
        let Some(versions) = self.schemas.get(&event.event_type) else {
            return Validation::invalid(format!("unknown event type: {}", self.describe(event)));
        };

        let declared = match parse_version(&event.version) {
            Ok(version) => version,
            Err(e) => return Validation::invalid(e.to_string()),
        };

        let Some(latest) = self.latest_version(&event.event_type) else {
            return Validation::invalid(format!("no versions registered for {}", event.event_type));
        };

        match versions.get(&declared) {
            Some(registered) => {
                let needs_migration = declared < latest;
                if !needs_migration {
                    return self.check(registered, event);
                }

                match self.resolve_path(&event.event_type, registered, &declared, &latest) {
                    Some(hops) => self.migrate(event, &declared, &latest, &hops, versions),
                    // No way forward; the declared version stands on its own.
                    None => self.check(registered, event),
                }
            }
            None => {
                // Unknown version: a direct transform to the latest version is
                // the only way in.
                let direct = (declared.clone(), latest.clone());
                if self.transform_for(&event.event_type, &direct).is_some() {
                    self.migrate(event, &declared, &latest, &[direct], versions)
                } else {
                    Validation::invalid(format!(
                        "unknown version {} for {} and no migration path to {latest}",
                        event.version, event.event_type
                    ))
                }
            }
        }
    }

    fn describe(&self, event: &Event) -> String {
        format!("{}@{}", event.event_type, event.version)
    }

    fn check(&self, registered: &RegisteredSchema, event: &Event) -> Validation {
        match registered.compiled.validate(&event.data) {
            Ok(()) => Validation {
                valid: true,
                errors: Vec::new(),
                migrated_event: None,
            },
            Err(errors) => Validation {
                valid: false,
                errors: errors
                    .map(|e| format!("{}: {e}", self.describe(event)))
                    .collect(),
                migrated_event: None,
            },
        }
    }

    fn transform_for(
        &self,
        event_type: &str,
        hop: &(Version, Version),
    ) -> Option<&Arc<MigrationFn>> {
        self.migrations.get(event_type)?.get(hop)
    }

    /// Resolve the hop list from `declared` to `latest`, preferring the
    /// schema's declared migration path and falling back to a direct
    /// transform.
    fn resolve_path(
        &self,
        event_type: &str,
        registered: &RegisteredSchema,
        declared: &Version,
        latest: &Version,
    ) -> Option<Vec<(Version, Version)>> {
        if !registered.migration_path.is_empty() {
            let mut hops = Vec::with_capacity(registered.migration_path.len());
            let mut current = declared.clone();
            for next in &registered.migration_path {
                hops.push((current.clone(), next.clone()));
                current = next.clone();
            }
            if &current == latest
                && hops.iter().all(|hop| self.transform_for(event_type, hop).is_some())
            {
                return Some(hops);
            }
        }

        let direct = (declared.clone(), latest.clone());
        if self.transform_for(event_type, &direct).is_some() {
            return Some(vec![direct]);
        }
        None
    }

    fn migrate(
        &self,
        event: &Event,
        declared: &Version,
        latest: &Version,
        hops: &[(Version, Version)],
        versions: &BTreeMap<Version, RegisteredSchema>,
    ) -> Validation {
        let mut data = event.data.clone();
        for hop in hops {
            let Some(transform) = self.transform_for(&event.event_type, hop) else {
                return Validation::invalid(format!(
                    "missing migration {} {} -> {}",
                    event.event_type, hop.0, hop.1
                ));
            };
            data = match transform(data) {
                Ok(next) => next,
                Err(reason) => {
                    let err = SchemaError::MigrationFailed {
                        event_type: event.event_type.clone(),
                        from: hop.0.clone(),
                        to: hop.1.clone(),
                        reason,
                    };
                    return Validation::invalid(err.to_string());
                }
            };
        }

        let migrated = Event {
            version: latest.to_string(),
            data,
            ..event.clone()
        }
        .with_metadata(json!({
            "migrated": true,
            "migratedFrom": declared.to_string(),
        }));

        let Some(target) = versions.get(latest) else {
            return Validation::invalid(format!(
                "latest version {latest} of {} has no registered schema",
                event.event_type
            ));
        };

        let validation_errors: Option<Vec<String>> = match target.compiled.validate(&migrated.data)
        {
            Ok(()) => None,
            Err(errors) => Some(
                errors
                    .map(|e| format!("migrated {}@{latest}: {e}", event.event_type))
                    .collect(),
            ),
        };

        match validation_errors {
            None => {
                tracing::debug!(
                    event_type = %event.event_type,
                    from = %declared,
                    to = %latest,
                    event_id = %event.id,
                    "Migrated event to latest schema version"
                );
                Validation {
                    valid: true,
                    errors: Vec::new(),
                    migrated_event: Some(migrated),
                }
            }
            Some(errors) => Validation {
                valid: false,
                errors,
                migrated_event: None,
            },
        }
    }

    #[allow(clippy::expect_used)] // Built-in schemas are static literals; a failure is a programming error caught by tests.
    fn register_builtin_schemas(&mut self) {
        let order_created = json!({
            "type": "object",
            "required": ["orderId", "total", "currency", "products"],
            "properties": {
                "orderId": { "type": "string" },
                "customerName": { "type": "string" },
                "email": { "type": "string" },
                "total": { "type": "number" },
                "currency": { "type": "string" },
                "products": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["title", "price", "quantity"],
                        "properties": {
                            "productId": { "type": "string" },
                            "title": { "type": "string" },
                            "price": { "type": "number" },
                            "quantity": { "type": "integer" }
                        }
                    }
                }
            }
        });
        self.register("order.created", "1.0.0", &order_created, SchemaOptions::default())
            .expect("builtin order.created schema");

        let user_registered_v1 = json!({
            "type": "object",
            "required": ["userId", "email"],
            "properties": {
                "userId": { "type": "string" },
                "email": { "type": "string" },
                "name": { "type": "string" }
            }
        });
        self.register(
            "user.registered",
            "1.0.0",
            &user_registered_v1,
            SchemaOptions {
                deprecated: true,
                migration_path: vec![Version::new(1, 1, 0)],
            },
        )
        .expect("builtin user.registered 1.0.0 schema");

        let user_registered_v1_1 = json!({
            "type": "object",
            "required": ["userId", "email", "timezone"],
            "properties": {
                "userId": { "type": "string" },
                "email": { "type": "string" },
                "name": { "type": "string" },
                "timezone": { "type": "string" }
            }
        });
        self.register(
            "user.registered",
            "1.1.0",
            &user_registered_v1_1,
            SchemaOptions::default(),
        )
        .expect("builtin user.registered 1.1.0 schema");

        self.register_migration("user.registered", "1.0.0", "1.1.0", |mut data| {
            let object = data
                .as_object_mut()
                .ok_or_else(|| "user.registered data must be an object".to_string())?;
            object
                .entry("timezone".to_string())
                .or_insert_with(|| json!("UTC"));
            Ok(data)
        })
        .expect("builtin user.registered migration");

        let signup_completed = json!({
            "type": "object",
            "required": ["userId"],
            "properties": {
                "userId": { "type": "string" },
                "plan": { "type": "string" },
                "referrer": { "type": "string" }
            }
        });
        self.register("signup.completed", "1.0.0", &signup_completed, SchemaOptions::default())
            .expect("builtin signup.completed schema");
    }
}

fn parse_version(version: &str) -> Result<Version, SchemaError> {
    Version::parse(version).map_err(|e| SchemaError::InvalidVersion {
        version: version.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn order_event(data: serde_json::Value) -> Event {
        Event::new("order.created", "1.0.0", "test", "org-1", data)
    }

    #[test]
    fn valid_event_passes_without_migration() {
        let registry = SchemaRegistry::with_builtins();
        let event = order_event(json!({
            "orderId": "1001",
            "total": 49.99,
            "currency": "USD",
            "products": [{ "title": "Mug", "price": 49.99, "quantity": 1 }]
        }));

        let outcome = registry.validate(&event);
        assert!(outcome.valid, "errors: {:?}", outcome.errors);
        assert!(!outcome.migrated());
    }

    #[test]
    fn schema_mismatch_is_invalid_with_errors() {
        let registry = SchemaRegistry::with_builtins();
        let event = order_event(json!({ "orderId": "1001" }));

        let outcome = registry.validate(&event);
        assert!(!outcome.valid);
        assert!(!outcome.errors.is_empty());
    }

    #[test]
    fn unknown_event_type_is_invalid() {
        let registry = SchemaRegistry::with_builtins();
        let event = Event::new("mystery.kind", "1.0.0", "test", "org-1", json!({}));

        let outcome = registry.validate(&event);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("unknown event type"));
    }

    #[test]
    fn unknown_version_without_path_is_invalid() {
        let registry = SchemaRegistry::with_builtins();
        let event = Event::new("order.created", "9.9.9", "test", "org-1", json!({}));

        let outcome = registry.validate(&event);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("no migration path"));
    }

    #[test]
    fn old_version_migrates_to_latest() {
        let registry = SchemaRegistry::with_builtins();
        let event = Event::new(
            "user.registered",
            "1.0.0",
            "web",
            "org-1",
            json!({ "userId": "u-1", "email": "a@example.com" }),
        );

        let outcome = registry.validate(&event);
        assert!(outcome.valid, "errors: {:?}", outcome.errors);
        assert!(outcome.migrated());

        let migrated = outcome.migrated_event.unwrap();
        assert_eq!(migrated.version, "1.1.0");
        assert_eq!(migrated.data["timezone"], "UTC");
        assert_eq!(migrated.metadata.as_ref().unwrap()["migrated"], true);
        assert_eq!(migrated.metadata.as_ref().unwrap()["migratedFrom"], "1.0.0");
        // Identity fields survive migration untouched.
        assert_eq!(migrated.id, event.id);
        assert_eq!(migrated.organization_id, event.organization_id);
    }

    #[test]
    fn migration_preserves_existing_timezone() {
        let registry = SchemaRegistry::with_builtins();
        let event = Event::new(
            "user.registered",
            "1.0.0",
            "web",
            "org-1",
            json!({ "userId": "u-1", "email": "a@example.com", "timezone": "Europe/Paris" }),
        );

        let outcome = registry.validate(&event);
        let migrated = outcome.migrated_event.unwrap();
        assert_eq!(migrated.data["timezone"], "Europe/Paris");
    }

    #[test]
    fn latest_version_skips_deprecated() {
        let registry = SchemaRegistry::with_builtins();
        assert_eq!(
            registry.latest_version("user.registered"),
            Some(Version::new(1, 1, 0))
        );
    }

    #[test]
    fn failing_transform_surfaces_as_invalid() {
        let mut registry = SchemaRegistry::new();
        let schema = json!({ "type": "object" });
        registry
            .register("widget.moved", "1.0.0", &schema, SchemaOptions {
                deprecated: true,
                migration_path: vec![Version::new(2, 0, 0)],
            })
            .unwrap();
        registry
            .register("widget.moved", "2.0.0", &schema, SchemaOptions::default())
            .unwrap();
        registry
            .register_migration("widget.moved", "1.0.0", "2.0.0", |_| {
                Err("boom".to_string())
            })
            .unwrap();

        let event = Event::new("widget.moved", "1.0.0", "test", "org-1", json!({}));
        let outcome = registry.validate(&event);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("boom"));
    }

    #[test]
    fn migrated_event_satisfies_latest_schema() {
        // The invariant behind every migration: outputs validate at latest.
        let registry = SchemaRegistry::with_builtins();
        let event = Event::new(
            "user.registered",
            "1.0.0",
            "web",
            "org-1",
            json!({ "userId": "u-1", "email": "a@example.com" }),
        );

        let migrated = registry.validate(&event).migrated_event.unwrap();
        let recheck = registry.validate(&migrated);
        assert!(recheck.valid);
        assert!(!recheck.migrated(), "latest version does not re-migrate");
    }
}
