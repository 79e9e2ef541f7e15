//! Template and policy lookups.
//!
//! Templates, A/B tests, user preferences, and business-hours policies are
//! owned by the admin surface and its relational store - outside this
//! system. The materializer only reads, so the seam is one trait; the
//! in-memory implementation backs tests and single-tenant deployments.

use crate::error::MaterializerError;
use crate::model::{AbTest, Template};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Per-user notification preferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPreferences {
    /// Master switch; `false` filters everything for the user.
    pub enabled: bool,
    /// Channels the user muted.
    pub muted_channels: Vec<String>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            muted_channels: Vec::new(),
        }
    }
}

/// A site's business-hours policy.
///
/// The offset is stored directly instead of an IANA zone name so
/// evaluation needs no timezone database; the admin surface owns the
/// conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessHours {
    /// Minutes east of UTC (e.g. `-300` for New York in winter).
    pub utc_offset_minutes: i32,
    /// First delivering hour, 0-23, inclusive.
    pub open_hour: u8,
    /// First non-delivering hour, 0-23, exclusive.
    pub close_hour: u8,
    /// Delivering weekdays, 0 = Monday … 6 = Sunday.
    pub days: Vec<u8>,
}

/// Read access to templates and delivery policies.
pub trait TemplateStore: Send + Sync {
    /// Active templates for a site and event type.
    fn find_active_templates(
        &self,
        site_id: &str,
        event_type: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Template>, MaterializerError>> + Send;

    /// A template by id, active or not.
    fn find_template(
        &self,
        template_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Template>, MaterializerError>> + Send;

    /// Active A/B tests attached to a template.
    fn active_ab_tests(
        &self,
        site_id: &str,
        template_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<AbTest>, MaterializerError>> + Send;

    /// A user's preferences; `None` means no record (allow everything).
    fn user_preferences(
        &self,
        site_id: &str,
        user_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<UserPreferences>, MaterializerError>> + Send;

    /// A site's business hours; `None` means always open.
    fn business_hours(
        &self,
        site_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<BusinessHours>, MaterializerError>> + Send;
}

#[derive(Default)]
struct Inner {
    templates: Vec<Template>,
    ab_tests: Vec<AbTest>,
    preferences: HashMap<(String, String), UserPreferences>,
    business_hours: HashMap<String, BusinessHours>,
}

/// In-memory template store for tests and single-tenant mode.
#[derive(Default)]
pub struct InMemoryTemplateStore {
    inner: Mutex<Inner>,
}

impl InMemoryTemplateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner)
    }

    /// Add a template.
    pub fn put_template(&self, template: Template) {
        self.with_inner(|inner| {
            inner.templates.retain(|t| t.id != template.id);
            inner.templates.push(template);
        });
    }

    /// Add an A/B test.
    pub fn put_ab_test(&self, test: AbTest) {
        self.with_inner(|inner| {
            inner.ab_tests.retain(|t| t.id != test.id);
            inner.ab_tests.push(test);
        });
    }

    /// Set a user's preferences.
    pub fn put_preferences(&self, site_id: &str, user_id: &str, preferences: UserPreferences) {
        self.with_inner(|inner| {
            inner
                .preferences
                .insert((site_id.to_string(), user_id.to_string()), preferences);
        });
    }

    /// Set a site's business hours.
    pub fn put_business_hours(&self, site_id: &str, hours: BusinessHours) {
        self.with_inner(|inner| {
            inner.business_hours.insert(site_id.to_string(), hours);
        });
    }
}

impl TemplateStore for InMemoryTemplateStore {
    async fn find_active_templates(
        &self,
        site_id: &str,
        event_type: &str,
    ) -> Result<Vec<Template>, MaterializerError> {
        Ok(self.with_inner(|inner| {
            inner
                .templates
                .iter()
                .filter(|t| t.active && t.site_id == site_id && t.event_type == event_type)
                .cloned()
                .collect()
        }))
    }

    async fn find_template(
        &self,
        template_id: &str,
    ) -> Result<Option<Template>, MaterializerError> {
        Ok(self.with_inner(|inner| {
            inner
                .templates
                .iter()
                .find(|t| t.id == template_id)
                .cloned()
        }))
    }

    async fn active_ab_tests(
        &self,
        site_id: &str,
        template_id: &str,
    ) -> Result<Vec<AbTest>, MaterializerError> {
        Ok(self.with_inner(|inner| {
            inner
                .ab_tests
                .iter()
                .filter(|t| t.active && t.site_id == site_id && t.template_id == template_id)
                .cloned()
                .collect()
        }))
    }

    async fn user_preferences(
        &self,
        site_id: &str,
        user_id: &str,
    ) -> Result<Option<UserPreferences>, MaterializerError> {
        Ok(self.with_inner(|inner| {
            inner
                .preferences
                .get(&(site_id.to_string(), user_id.to_string()))
                .cloned()
        }))
    }

    async fn business_hours(
        &self,
        site_id: &str,
    ) -> Result<Option<BusinessHours>, MaterializerError> {
        Ok(self.with_inner(|inner| inner.business_hours.get(site_id).cloned()))
    }
}
