//! Template rendering.
//!
//! Templates use a restricted expression language (tera) - interpolation,
//! filters, and conditional blocks only, no arbitrary code. A custom
//! `currency` filter joins the built-in `truncate`/`capitalize`/`date`
//! helpers. Compiled templates and rendered output are cached
//! independently, and every rendered HTML body passes the sanitizer before
//! leaving this module.

use crate::cache::{AccessCountCache, TtlCache};
use crate::error::MaterializerError;
use crate::model::{RenderMetadata, RenderedContent, Template};
use crate::sanitize;
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tera::Tera;

const HTML_TEMPLATE: &str = "html";
const TEXT_TEMPLATE: &str = "text";
const SUBJECT_TEMPLATE: &str = "subject";

/// Renderer tuning knobs.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Compiled-template cache capacity.
    pub compiled_capacity: usize,
    /// Rendered-output cache capacity.
    pub rendered_capacity: usize,
    /// Rendered-output TTL.
    pub rendered_ttl: Duration,
    /// Per-render time budget.
    pub timeout: Duration,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            compiled_capacity: 128,
            rendered_capacity: 512,
            rendered_ttl: Duration::from_secs(60),
            timeout: Duration::from_secs(1),
        }
    }
}

/// Outcome of validating a template in isolation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateValidation {
    /// Whether the template may be used.
    pub is_valid: bool,
    /// Hard failures.
    pub errors: Vec<String>,
    /// Advisory findings.
    pub warnings: Vec<String>,
}

/// Caching, sanitizing template renderer.
#[derive(Clone)]
pub struct Renderer {
    inner: Arc<RendererInner>,
}

struct RendererInner {
    compiled: AccessCountCache<String, Arc<Tera>>,
    rendered: TtlCache<u64, RenderedContent>,
    config: RendererConfig,
}

impl Renderer {
    /// Create a renderer with the given configuration.
    #[must_use]
    pub fn new(config: RendererConfig) -> Self {
        Self {
            inner: Arc::new(RendererInner {
                compiled: AccessCountCache::new(config.compiled_capacity),
                rendered: TtlCache::new(config.rendered_capacity, config.rendered_ttl),
                config,
            }),
        }
    }

    /// The configured render timeout, enforced by [`Renderer::render`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.config.timeout
    }

    /// Render a template against an event context, with caching and the
    /// configured time budget.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializerError::Render`] on compile or render failure
    /// and [`MaterializerError::RenderTimeout`] when the budget is
    /// exceeded.
    pub async fn render(
        &self,
        template: &Template,
        context: &serde_json::Value,
    ) -> Result<RenderedContent, MaterializerError> {
        let cache_key = Self::rendered_key(template, context);
        if let Some(hit) = self.inner.rendered.get(&cache_key) {
            metrics::counter!("materializer.render_cache_hits").increment(1);
            return Ok(hit);
        }

        let template_id = template.id.clone();
        let renderer = self.clone();
        let template = template.clone();
        let context = context.clone();
        let work = tokio::task::spawn_blocking(move || renderer.render_sync(&template, &context));

        match tokio::time::timeout(self.inner.config.timeout, work).await {
            Ok(Ok(result)) => {
                let content = result?;
                self.inner.rendered.insert(cache_key, content.clone());
                Ok(content)
            }
            Ok(Err(join_error)) => Err(MaterializerError::Render {
                template_id,
                reason: format!("render task failed: {join_error}"),
            }),
            Err(_) => Err(MaterializerError::RenderTimeout(template_id)),
        }
    }

    fn render_sync(
        &self,
        template: &Template,
        context: &serde_json::Value,
    ) -> Result<RenderedContent, MaterializerError> {
        let started = Instant::now();
        let tera = self.compiled_for(template)?;
        let ctx = Self::context_of(context).map_err(|reason| MaterializerError::Render {
            template_id: template.id.clone(),
            reason,
        })?;

        let html = if template.html.is_empty() {
            String::new()
        } else {
            let raw = tera
                .render(HTML_TEMPLATE, &ctx)
                .map_err(|e| MaterializerError::Render {
                    template_id: template.id.clone(),
                    reason: render_reason(&e),
                })?;
            sanitize::sanitize(&raw)
        };

        let text = match &template.text_fallback {
            Some(_) => Some(tera.render(TEXT_TEMPLATE, &ctx).map_err(|e| {
                MaterializerError::Render {
                    template_id: template.id.clone(),
                    reason: render_reason(&e),
                }
            })?),
            None if !html.is_empty() => Some(sanitize::html_to_text(&html)),
            None => None,
        };

        let subject = match &template.subject {
            Some(_) => Some(tera.render(SUBJECT_TEMPLATE, &ctx).map_err(|e| {
                MaterializerError::Render {
                    template_id: template.id.clone(),
                    reason: render_reason(&e),
                }
            })?),
            None => None,
        };

        #[allow(clippy::cast_possible_truncation)] // Render times are bounded by the 1s budget.
        let render_time_ms = started.elapsed().as_millis() as u64;
        metrics::histogram!("materializer.render_time_ms").record(render_time_ms as f64);

        Ok(RenderedContent {
            html,
            css: template.css.clone(),
            text,
            subject,
            metadata: RenderMetadata {
                template_id: template.id.clone(),
                rendered_at: Utc::now(),
                render_time_ms,
            },
        })
    }

    /// Validate a template without rendering it into the pipeline.
    #[must_use]
    pub fn validate_template(template: &Template) -> TemplateValidation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if template.html.is_empty() && template.text_fallback.is_none() {
            errors.push("template has neither html nor a text fallback".to_string());
        }
        if template.channels.is_empty() {
            warnings.push("template has no delivery channels".to_string());
        }
        if template.text_fallback.is_none() && !template.html.is_empty() {
            warnings.push("text will be derived from html".to_string());
        }

        for (name, source) in [
            (HTML_TEMPLATE, Some(&template.html)),
            (TEXT_TEMPLATE, template.text_fallback.as_ref()),
            (SUBJECT_TEMPLATE, template.subject.as_ref()),
        ] {
            let Some(source) = source else { continue };
            if source.is_empty() {
                continue;
            }
            let mut tera = Tera::default();
            if let Err(e) = tera.add_raw_template(name, source) {
                errors.push(format!("{name} template does not compile: {}", render_reason(&e)));
            }
        }

        errors.extend(sanitize::validate(&template.html));

        TemplateValidation {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    fn compiled_for(&self, template: &Template) -> Result<Arc<Tera>, MaterializerError> {
        let key = template.cache_key();
        if let Some(hit) = self.inner.compiled.get(&key) {
            return Ok(hit);
        }

        let mut tera = Tera::default();
        let mut sources = vec![(HTML_TEMPLATE, template.html.as_str())];
        if let Some(text) = &template.text_fallback {
            sources.push((TEXT_TEMPLATE, text.as_str()));
        }
        if let Some(subject) = &template.subject {
            sources.push((SUBJECT_TEMPLATE, subject.as_str()));
        }
        tera.add_raw_templates(sources)
            .map_err(|e| MaterializerError::Render {
                template_id: template.id.clone(),
                reason: render_reason(&e),
            })?;
        tera.register_filter("currency", currency_filter);

        let tera = Arc::new(tera);
        self.inner.compiled.insert(key, Arc::clone(&tera));
        metrics::counter!("materializer.templates_compiled").increment(1);
        Ok(tera)
    }

    fn context_of(context: &serde_json::Value) -> Result<tera::Context, String> {
        let wrapped = if context.is_object() {
            context.clone()
        } else {
            serde_json::json!({ "data": context })
        };
        tera::Context::from_value(wrapped).map_err(|e| e.to_string())
    }

    fn rendered_key(template: &Template, context: &serde_json::Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        template.cache_key().hash(&mut hasher);
        context.to_string().hash(&mut hasher);
        hasher.finish()
    }
}

/// Tera error displays hide the cause; unwrap one level for diagnostics.
fn render_reason(error: &tera::Error) -> String {
    use std::error::Error;
    match error.source() {
        Some(source) => format!("{error}: {source}"),
        None => error.to_string(),
    }
}

/// `{{ total | currency(code=currency) }}` → `$49.99`.
#[allow(clippy::unnecessary_wraps)] // Signature fixed by tera.
fn currency_filter(
    value: &tera::Value,
    args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let amount = value.as_f64().unwrap_or(0.0);
    let code = args
        .get("code")
        .and_then(|code| code.as_str())
        .unwrap_or("USD")
        .to_uppercase();

    let formatted = match code.as_str() {
        "USD" => format!("${amount:.2}"),
        "EUR" => format!("€{amount:.2}"),
        "GBP" => format!("£{amount:.2}"),
        other => format!("{other} {amount:.2}"),
    };
    Ok(tera::Value::String(formatted))
}
