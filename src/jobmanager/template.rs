//! Cluster submission script templates.
//!
//! Templates contain `__MRO_<NAME>__` placeholders. Rendering happens in two
//! passes: the parameter values are computed first, then each line is
//! either dropped (if it names a parameter whose value is empty) or has its
//! placeholders substituted. Placeholders for names that are not parameters
//! are left untouched.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| {
        Regex::new(r"__MRO_([A-Z0-9]+(?:_[A-Z0-9]+)*)__").expect("Invalid template token regex")
    })
}

/// Formats the placeholder for a parameter name.
pub fn token(name: &str) -> String {
    format!("__MRO_{}__", name)
}

/// Parameter values keyed by placeholder name, e.g. `"MEM_GB"`.
pub type TemplateParams = BTreeMap<&'static str, String>;

/// A submission script template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTemplate {
    text: String,
}

impl JobTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the template contains the placeholder for `name`.
    pub fn has_token(&self, name: &str) -> bool {
        token_regex()
            .captures_iter(&self.text)
            .any(|c| &c[1] == name)
    }

    /// Whether the template contains any placeholder whose name starts with
    /// `prefix`.
    pub fn has_token_with_prefix(&self, prefix: &str) -> bool {
        token_regex()
            .captures_iter(&self.text)
            .any(|c| c[1].starts_with(prefix))
    }

    /// Renders the template with the given parameters.
    pub fn render(&self, params: &TemplateParams) -> String {
        let re = token_regex();
        let mut out = String::with_capacity(self.text.len());
        for line in self.text.split_inclusive('\n') {
            let drop_line = re.captures_iter(line).any(|c| {
                params
                    .get(&c[1])
                    .is_some_and(|value| value.is_empty())
            });
            if drop_line {
                continue;
            }
            let rendered = re.replace_all(line, |c: &Captures| match params.get(&c[1]) {
                Some(value) => value.clone(),
                None => c[0].to_string(),
            });
            out.push_str(&rendered);
        }
        out
    }
}
