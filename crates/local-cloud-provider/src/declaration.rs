//! Template declaration parsing.
//!
//! Templates are declared one per line as `<name>@<source path>`. Lines of
//! the form `@@<name>:<modifier>` adjust a declared template:
//!
//! ```text
//! build1@/opt/agents/build1
//! build2@/opt/agents/build2.zip
//! @@build1:reuse
//! @@build1:delay
//! @@build1:agentPoolId:3
//! @@build1:prop:env.JDK=/usr/lib/jvm/17
//! ```
//!
//! Bad `name@path` lines do not stop parsing; they are collected into one
//! error message and the remaining lines still produce templates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

const MODIFIER_PREFIX: &str = "@@";

/// A parsed template declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDeclaration {
    /// Template name.
    pub name: String,
    /// Directory or `.zip` archive holding the worker files.
    pub source_path: PathBuf,
    /// Keep stopped instances for reuse.
    pub reusable: bool,
    /// Reported to hosts; not acted on by the provider.
    pub eternal_starting: bool,
    /// Orchestrator pool new workers join.
    pub agent_pool_id: Option<i32>,
    /// Properties merged into every provisioned worker's configuration.
    pub extra_properties: BTreeMap<String, String>,
}

impl TemplateDeclaration {
    /// Create a one-shot declaration with no modifiers.
    #[must_use]
    pub fn new(name: impl Into<String>, source_path: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.as_ref().to_path_buf(),
            reusable: false,
            eternal_starting: false,
            agent_pool_id: None,
            extra_properties: BTreeMap::new(),
        }
    }

    fn apply_modifier(&mut self, modifier: &str) {
        match modifier {
            "reuse" => self.reusable = true,
            "delay" => self.eternal_starting = true,
            _ => {
                if let Some(pool_id) = modifier.strip_prefix("agentPoolId:") {
                    match pool_id.trim().parse() {
                        Ok(id) => self.agent_pool_id = Some(id),
                        Err(e) => warn!(
                            template = %self.name,
                            value = pool_id,
                            error = %e,
                            "Could not parse agent pool id"
                        ),
                    }
                } else if let Some(prop) = modifier.strip_prefix("prop:") {
                    match prop.trim().split_once('=') {
                        Some((key, value)) => {
                            self.extra_properties
                                .insert(key.trim().to_string(), value.trim().to_string());
                        }
                        None => warn!(
                            template = %self.name,
                            property = prop,
                            "Ignoring property without '='"
                        ),
                    }
                } else {
                    warn!(template = %self.name, modifier, "Ignoring unknown template modifier");
                }
            }
        }
    }
}

/// Result of parsing declaration text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Declarations {
    /// Accepted templates, in declaration order.
    pub templates: Vec<TemplateDeclaration>,
    /// Aggregated message for rejected input, if any.
    pub error: Option<String>,
}

/// Parse declaration text.
#[must_use]
pub fn parse(text: &str) -> Declarations {
    let text = text.trim();
    if text.is_empty() {
        return Declarations {
            templates: Vec::new(),
            error: Some("No templates specified".to_string()),
        };
    }

    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let mut templates = Vec::new();
    let mut failures = Vec::new();

    for line in &lines {
        if line.is_empty() || line.starts_with(MODIFIER_PREFIX) {
            continue;
        }

        let Some((name, path)) = line.split_once('@') else {
            failures.push(format!("Failed to parse template declaration: \"{line}\"."));
            continue;
        };

        let mut declaration = TemplateDeclaration::new(name.trim(), path.trim());
        let prefix = format!("{MODIFIER_PREFIX}{}:", declaration.name);
        for modifier in lines.iter().filter_map(|l| l.strip_prefix(prefix.as_str())) {
            declaration.apply_modifier(modifier.trim());
        }
        templates.push(declaration);
    }

    Declarations {
        templates,
        error: (!failures.is_empty()).then(|| failures.join(" ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_template_with_modifiers() {
        let parsed = parse("build1@/templates/agentA\n@@build1:reuse\n@@build1:prop:foo=bar");

        assert!(parsed.error.is_none());
        assert_eq!(parsed.templates.len(), 1);
        let template = &parsed.templates[0];
        assert_eq!(template.name, "build1");
        assert_eq!(template.source_path, PathBuf::from("/templates/agentA"));
        assert!(template.reusable);
        assert!(!template.eternal_starting);
        assert_eq!(template.extra_properties.get("foo").map(String::as_str), Some("bar"));
    }

    #[test]
    fn parse_trims_names_and_paths() {
        let parsed = parse("  a @ /x/y  \n\n   b@/z.zip\n");
        let names: Vec<_> = parsed.templates.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(parsed.templates[0].source_path, PathBuf::from("/x/y"));
        assert!(parsed.error.is_none());
    }

    #[test]
    fn empty_text_is_an_error() {
        for text in ["", "   \n  \n"] {
            let parsed = parse(text);
            assert!(parsed.templates.is_empty());
            assert_eq!(parsed.error.as_deref(), Some("No templates specified"));
        }
    }

    #[test]
    fn bad_lines_are_aggregated() {
        let parsed = parse("badline\ngood@/a\nworse");

        assert_eq!(parsed.templates.len(), 1);
        let error = parsed.error.unwrap();
        assert_eq!(
            error,
            "Failed to parse template declaration: \"badline\". \
             Failed to parse template declaration: \"worse\"."
        );
    }

    #[test]
    fn only_bad_lines() {
        let parsed = parse("badline");
        assert!(parsed.templates.is_empty());
        assert!(parsed.error.unwrap().contains("badline"));
    }

    #[test]
    fn modifiers_apply_to_named_template_only() {
        let parsed = parse(
            "a@/a\nb@/b\n@@b:delay\n@@b:agentPoolId:42\n@@a:prop:x = 1=2\n@@a:unknown",
        );

        let a = &parsed.templates[0];
        let b = &parsed.templates[1];
        assert!(!a.eternal_starting);
        assert_eq!(a.agent_pool_id, None);
        assert_eq!(a.extra_properties.get("x").map(String::as_str), Some("1=2"));
        assert!(b.eternal_starting);
        assert_eq!(b.agent_pool_id, Some(42));
        assert!(!b.reusable);
    }

    #[test]
    fn bad_pool_id_is_ignored() {
        let parsed = parse("a@/a\n@@a:agentPoolId:lots");
        assert_eq!(parsed.templates[0].agent_pool_id, None);
        assert!(parsed.error.is_none());
    }

    #[test]
    fn modifier_lines_are_not_declarations() {
        let parsed = parse("@@a:reuse\na@/a");
        assert_eq!(parsed.templates.len(), 1);
        assert!(parsed.templates[0].reusable);
    }
}
