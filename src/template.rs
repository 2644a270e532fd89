//! Facade over the template engine used to render managed payloads.
//!
//! Callers hand in the declared template keys and the fetched secret map;
//! each template sees every source entry as `{ value, secretPath }`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use tera::Tera;

use crate::crd::SecretTemplate;

/// One source entry exposed to templates.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSource {
    pub value: String,
    pub secret_path: String,
}

/// Render every declared template key against the source map.
pub fn render_templates(
    templates: &BTreeMap<String, String>,
    sources: &BTreeMap<String, TemplateSource>,
) -> Result<BTreeMap<String, String>> {
    let mut tera = Tera::default();
    for (key, template) in templates {
        tera.add_raw_template(key, template)
            .with_context(|| format!("unable to compile template: {key}"))?;
    }

    let mut context = tera::Context::new();
    for (key, source) in sources {
        context.insert(key.as_str(), source);
    }

    let mut rendered = BTreeMap::new();
    for key in templates.keys() {
        let output = tera
            .render(key, &context)
            .with_context(|| format!("unable to render template: {key}"))?;
        rendered.insert(key.clone(), output);
    }

    Ok(rendered)
}

/// Build a managed payload: the verbatim source set when no template is
/// declared (or when it opts into `includeAllSecrets`), plus every rendered
/// template key. Template keys win on collision.
pub fn render_payload(
    template: Option<&SecretTemplate>,
    sources: &BTreeMap<String, TemplateSource>,
) -> Result<BTreeMap<String, String>> {
    let mut payload = BTreeMap::new();

    let include_verbatim = template.map(|t| t.include_all_secrets).unwrap_or(true);
    if include_verbatim {
        for (key, source) in sources {
            payload.insert(key.clone(), source.value.clone());
        }
    }

    if let Some(template) = template {
        if !template.data.is_empty() {
            payload.extend(render_templates(&template.data, sources)?);
        }
    }

    Ok(payload)
}
