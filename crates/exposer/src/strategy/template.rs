use lazy_static::lazy_static;
use regex::Regex;

use super::StrategyError;

const DEFAULT_URL_TEMPLATE: &str = "{{.Service}}.{{.Namespace}}.{{.Domain}}";

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{\s*\.(\w+)\s*\}\}").unwrap();
}

#[derive(Clone, Debug, PartialEq)]
enum Part {
    Text(String),
    Service,
    Namespace,
    Domain,
}

/// A host name template with `{{.Service}}`, `{{.Namespace}}` and `{{.Domain}}` placeholders.
#[derive(Clone, Debug, PartialEq)]
pub struct UrlTemplate {
    parts: Vec<Part>,
}

impl UrlTemplate {
    /// Parses a template. An empty template selects the default
    /// `{{.Service}}.{{.Namespace}}.{{.Domain}}`.
    pub fn parse(template: &str) -> Result<Self, StrategyError> {
        let template = if template.is_empty() {
            DEFAULT_URL_TEMPLATE
        } else {
            template
        };
        let invalid = |reason: String| StrategyError::InvalidUrlTemplate {
            template: template.to_owned(),
            reason,
        };

        let mut parts = Vec::new();
        let mut last = 0;
        for captures in PLACEHOLDER.captures_iter(template) {
            let (whole, field) = match (captures.get(0), captures.get(1)) {
                (Some(w), Some(f)) => (w, f),
                _ => continue,
            };
            if whole.start() > last {
                parts.push(Part::Text(template[last..whole.start()].to_owned()));
            }
            parts.push(match field.as_str() {
                "Service" => Part::Service,
                "Namespace" => Part::Namespace,
                "Domain" => Part::Domain,
                other => return Err(invalid(format!("unknown placeholder .{}", other))),
            });
            last = whole.end();
        }
        if last < template.len() {
            parts.push(Part::Text(template[last..].to_owned()));
        }
        if parts
            .iter()
            .any(|p| matches!(p, Part::Text(t) if t.contains("{{") || t.contains("}}")))
        {
            return Err(invalid("unbalanced braces".to_owned()));
        }
        Ok(UrlTemplate { parts })
    }

    /// Renders the host name of a service.
    pub fn render(&self, service: &str, namespace: &str, domain: &str) -> String {
        self.parts
            .iter()
            .map(|p| match p {
                Part::Text(t) => t.as_str(),
                Part::Service => service,
                Part::Namespace => namespace,
                Part::Domain => domain,
            })
            .collect()
    }
}
