//! User-facing installer settings (language, keyboard, locale)
//!
//! The presentation layer mutates these through [`SettingsStore`] before a
//! run starts. The pipeline never reads the store directly: it takes a
//! snapshot and passes it to the base system installer as an argument.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Locale that is always generated next to the user's choice
pub const FALLBACK_LOCALE: &str = "en_US.UTF-8";

/// Settings chosen in the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallerSettings {
    /// UI language code, e.g. `de`
    pub language: String,
    /// Console keymap / X11 layout, e.g. `de`
    pub keyboard_layout: String,
    /// glibc locale, e.g. `de_DE.UTF-8`
    pub locale: String,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            keyboard_layout: "us".to_string(),
            locale: FALLBACK_LOCALE.to_string(),
        }
    }
}

/// Default locale for a UI language code.
///
/// Accepts either a bare language (`de`) or a full locale (`pt_BR.UTF-8`).
pub fn locale_for_language(language: &str) -> String {
    if language.contains('_') {
        return if language.contains('.') {
            language.to_string()
        } else {
            format!("{}.UTF-8", language)
        };
    }
    let locale = match language {
        "en" => "en_US",
        "de" => "de_DE",
        "fr" => "fr_FR",
        "es" => "es_ES",
        "it" => "it_IT",
        "pt" => "pt_PT",
        "nl" => "nl_NL",
        "pl" => "pl_PL",
        "ru" => "ru_RU",
        "uk" => "uk_UA",
        "tr" => "tr_TR",
        "sv" => "sv_SE",
        "ja" => "ja_JP",
        "zh" => "zh_CN",
        "ko" => "ko_KR",
        _ => return FALLBACK_LOCALE.to_string(),
    };
    format!("{}.UTF-8", locale)
}

fn is_safe_token(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-.@".contains(c))
}

/// Shared, process-lifetime settings. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct SettingsStore {
    inner: Arc<RwLock<InstallerSettings>>,
}

impl SettingsStore {
    pub fn new(initial: InstallerSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Copy of the current settings.
    pub fn snapshot(&self) -> InstallerSettings {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Set the UI language and derive the matching locale.
    pub fn set_language(&self, language: &str) -> Result<InstallerSettings, String> {
        if !is_safe_token(language) {
            return Err(format!("Invalid language '{}'", language));
        }
        Ok(self.update(|s| {
            s.language = language.to_string();
            s.locale = locale_for_language(language);
        }))
    }

    pub fn set_keyboard(&self, layout: &str) -> Result<InstallerSettings, String> {
        if !is_safe_token(layout) {
            return Err(format!("Invalid keyboard layout '{}'", layout));
        }
        Ok(self.update(|s| s.keyboard_layout = layout.to_string()))
    }

    fn update(&self, f: impl FnOnce(&mut InstallerSettings)) -> InstallerSettings {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
        guard.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let store = SettingsStore::default();
        let s = store.snapshot();
        assert_eq!(s.language, "en");
        assert_eq!(s.keyboard_layout, "us");
        assert_eq!(s.locale, "en_US.UTF-8");
    }

    #[test]
    fn test_set_language_derives_locale() {
        let store = SettingsStore::default();
        let s = store.set_language("de").unwrap();
        assert_eq!(s.locale, "de_DE.UTF-8");

        let s = store.set_language("pt_BR").unwrap();
        assert_eq!(s.locale, "pt_BR.UTF-8");

        let s = store.set_language("xx").unwrap();
        assert_eq!(s.locale, FALLBACK_LOCALE);
    }

    #[test]
    fn test_clones_share_state() {
        let store = SettingsStore::default();
        let ui_handle = store.clone();
        ui_handle.set_keyboard("fr").unwrap();
        assert_eq!(store.snapshot().keyboard_layout, "fr");
    }

    #[test]
    fn test_rejects_unsafe_values() {
        let store = SettingsStore::default();
        assert!(store.set_keyboard("us; rm -rf /").is_err());
        assert!(store.set_language("").is_err());
        assert_eq!(store.snapshot(), InstallerSettings::default());
    }
}
