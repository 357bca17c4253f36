use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Translations of one string keyed by locale (`en`, `fr`, `en_GB`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalizedString {
    translations: BTreeMap<String, String>,
}

impl LocalizedString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, locale: &str, translation: &str) -> Self {
        self.add_translation(locale, translation);
        self
    }

    pub fn add_translation(&mut self, locale: &str, translation: &str) {
        self.translations
            .insert(locale.to_string(), translation.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.translations.is_empty()
    }

    pub fn locales(&self) -> impl Iterator<Item = &str> {
        self.translations.keys().map(String::as_str)
    }

    /// Exact translation for `locale`.
    pub fn translation_for(&self, locale: &str) -> Option<&str> {
        self.translations.get(locale).map(String::as_str)
    }

    /// Best translation for `locale`: the exact locale, then its language
    /// (`en` for `en_GB`), then any translation of the same language, then
    /// the first translation in locale order.
    pub fn get(&self, locale: &str) -> Option<&str> {
        if let Some(exact) = self.translation_for(locale) {
            return Some(exact);
        }
        let language = language_of(locale);
        if let Some(base) = self.translation_for(language) {
            return Some(base);
        }
        self.translations
            .iter()
            .find(|(l, _)| language_of(l) == language)
            .or_else(|| self.translations.iter().next())
            .map(|(_, t)| t.as_str())
    }
}

fn language_of(locale: &str) -> &str {
    locale.split(['_', '-']).next().unwrap_or(locale)
}
