use std::collections::BTreeMap;

use crate::config::TaxonomyConfig;

/// Fixed category → sub-category enumeration plus the resolution labels.
#[derive(Debug, Clone, Default)]
pub struct Taxonomy {
    categories: BTreeMap<String, Vec<String>>,
    resolutions: Vec<String>,
}

impl Taxonomy {
    pub fn new(categories: BTreeMap<String, Vec<String>>, resolutions: Vec<String>) -> Self {
        Self {
            categories,
            resolutions,
        }
    }

    pub fn from_config(config: &TaxonomyConfig) -> Self {
        Self::new(config.categories.clone(), config.resolutions.clone())
    }

    pub fn categories(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.categories.iter()
    }

    pub fn resolutions(&self) -> &[String] {
        &self.resolutions
    }

    /// Map a model's category/sub-category answer onto the canonical
    /// spelling, or explain why it is not an allowed pair.
    ///
    /// Matching ignores case and surrounding whitespace. A category that
    /// lists sub-categories requires one of them.
    pub fn canonical_pair(
        &self,
        category: &str,
        sub_category: Option<&str>,
    ) -> Result<(String, Option<String>), String> {
        let (name, subs) = self
            .categories
            .iter()
            .find(|(name, _)| eq_loose(name, category))
            .ok_or_else(|| format!("unknown category '{}'", category.trim()))?;

        let sub_category = sub_category.map(str::trim).filter(|s| !s.is_empty());
        match (subs.is_empty(), sub_category) {
            (true, None) => Ok((name.clone(), None)),
            (true, Some(sub)) => Err(format!("category '{}' has no sub-categories, got '{}'", name, sub)),
            (false, None) => Err(format!("category '{}' requires a sub-category", name)),
            (false, Some(sub)) => subs
                .iter()
                .find(|s| eq_loose(s, sub))
                .map(|s| (name.clone(), Some(s.clone())))
                .ok_or_else(|| format!("'{}' is not a sub-category of '{}'", sub, name)),
        }
    }

    pub fn canonical_resolution(&self, resolution: &str) -> Result<String, String> {
        self.resolutions
            .iter()
            .find(|r| eq_loose(r, resolution))
            .cloned()
            .ok_or_else(|| format!("unknown resolution '{}'", resolution.trim()))
    }

    /// Markdown-ish listing used inside prompts.
    pub fn render_categories(&self) -> String {
        self.categories
            .iter()
            .map(|(name, subs)| {
                if subs.is_empty() {
                    format!("- {}", name)
                } else {
                    format!("- {}: {}", name, subs.join(" | "))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn render_resolutions(&self) -> String {
        self.resolutions
            .iter()
            .map(|r| format!("- {}", r))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn eq_loose(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
