//! Hotkey bindings for the two logical voice actions.
//!
//! Bindings come from configuration as strings like `"Ctrl+Shift+M"`. They
//! are matched case-insensitively and regardless of modifier order.

use nexus_common::config::HotkeyConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HotkeyAction {
    ToggleMic,
    ToggleAudio,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HotkeyBindings {
    toggle_mic: Option<String>,
    toggle_audio: Option<String>,
}

impl HotkeyBindings {
    pub fn from_config(cfg: &HotkeyConfig) -> Self {
        Self {
            toggle_mic: normalize(&cfg.toggle_mic),
            toggle_audio: normalize(&cfg.toggle_audio),
        }
    }

    /// Action bound to a pressed combination, if any.
    pub fn action_for(&self, pressed: &str) -> Option<HotkeyAction> {
        let pressed = normalize(pressed)?;
        if self.toggle_mic.as_deref() == Some(pressed.as_str()) {
            Some(HotkeyAction::ToggleMic)
        } else if self.toggle_audio.as_deref() == Some(pressed.as_str()) {
            Some(HotkeyAction::ToggleAudio)
        } else {
            None
        }
    }
}

impl Default for HotkeyBindings {
    fn default() -> Self {
        Self::from_config(&HotkeyConfig::default())
    }
}

/// Canonical form: lowercase modifiers sorted, key last. Empty → unbound.
fn normalize(binding: &str) -> Option<String> {
    let mut parts: Vec<String> = binding
        .split('+')
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .map(|p| match p.as_str() {
            "control" | "cmdorctrl" => "ctrl".to_owned(),
            "option" => "alt".to_owned(),
            "cmd" | "command" | "super" => "meta".to_owned(),
            _ => p,
        })
        .collect();
    let key = parts.pop()?;
    parts.sort();
    parts.dedup();
    parts.push(key);
    Some(parts.join("+"))
}
