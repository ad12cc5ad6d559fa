use std::{collections::HashMap, fs, path::Path};

use anyhow::Context;
use chrono::FixedOffset;
use serde::Deserialize;
use shared::domain::UserId;

use crate::renderer::LabelZone;

pub const DEFAULT_SETTINGS_FILE: &str = "chat_client.toml";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClientSettings {
    pub page_url: String,
    pub current_user_id: Option<UserId>,
    /// Upload endpoint; the page url itself when unset.
    pub upload_url: Option<String>,
    pub session_cookie: Option<String>,
    pub csrf_token: Option<String>,
    pub utc_offset_minutes: Option<i32>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            page_url: "http://127.0.0.1:8000/communications/chats/1/".into(),
            current_user_id: None,
            upload_url: None,
            session_cookie: None,
            csrf_token: None,
            utc_offset_minutes: None,
        }
    }
}

impl ClientSettings {
    /// The configured fixed offset, or the local zone when unset.
    pub fn label_zone(&self) -> anyhow::Result<LabelZone> {
        match self.utc_offset_minutes {
            Some(minutes) => FixedOffset::east_opt(minutes * 60)
                .map(LabelZone::Fixed)
                .with_context(|| format!("utc offset of {minutes} minutes is out of range")),
            None => Ok(LabelZone::Local),
        }
    }
}

/// Defaults, then the settings file when present, then `APP__*` variables.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    let path = path.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));
    match fs::read_to_string(path) {
        Ok(raw) => {
            let file_cfg = toml::from_str::<HashMap<String, String>>(&raw)
                .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
            apply(&mut settings, |key| file_cfg.get(key).cloned())?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read settings file '{}'", path.display()));
        }
    }

    apply(&mut settings, |key| {
        std::env::var(format!("APP__{}", key.to_ascii_uppercase())).ok()
    })?;

    Ok(settings)
}

fn apply(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = lookup("page_url") {
        settings.page_url = v;
    }
    if let Some(v) = lookup("current_user_id") {
        let id = v
            .trim()
            .parse::<i64>()
            .with_context(|| format!("current_user_id '{v}' is not an integer"))?;
        settings.current_user_id = Some(UserId(id));
    }
    if let Some(v) = lookup("upload_url") {
        settings.upload_url = Some(v);
    }
    if let Some(v) = lookup("session_cookie") {
        settings.session_cookie = Some(v);
    }
    if let Some(v) = lookup("csrf_token") {
        settings.csrf_token = Some(v);
    }
    if let Some(v) = lookup("utc_offset_minutes") {
        let minutes = v
            .trim()
            .parse::<i32>()
            .with_context(|| format!("utc_offset_minutes '{v}' is not an integer"))?;
        settings.utc_offset_minutes = Some(minutes);
    }
    Ok(())
}
