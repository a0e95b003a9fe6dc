use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use mailmirror_source::{ArchiveConfig, ImapConfig};
use serde::Deserialize;

const DEFAULT_DB_PATH: &str = "maildb.sqlite";
const DEFAULT_MAILBOX: &str = "INBOX";

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MirrorConfig {
    #[serde(default = "default_db_path")]
    pub(crate) db_path: String,
    #[serde(default)]
    pub(crate) imap: Option<ImapConfig>,
    #[serde(default)]
    pub(crate) archive: Option<ArchiveConfig>,
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            imap: None,
            archive: None,
        }
    }
}

impl MirrorConfig {
    pub(crate) fn require_imap(&self) -> Result<&ImapConfig> {
        self.imap
            .as_ref()
            .ok_or_else(|| anyhow!("missing [imap] section in config"))
    }

    /// Mailbox used by thread commands when none is given.
    pub(crate) fn default_mailbox(&self) -> &str {
        self.imap
            .as_ref()
            .map(|imap| imap.mailbox.as_str())
            .unwrap_or(DEFAULT_MAILBOX)
    }
}

/// Loads `explicit` if given, otherwise the first config found in the usual
/// places. No config at all yields the defaults.
pub(crate) fn load_mirror_config(explicit: Option<&Path>) -> Result<MirrorConfig> {
    if let Some(path) = explicit {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        return parse_config(&content).with_context(|| format!("parsing {}", path.display()));
    }
    match load_config_text() {
        Some((path, content)) => {
            parse_config(&content).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(MirrorConfig::default()),
    }
}

fn parse_config(content: &str) -> Result<MirrorConfig> {
    Ok(toml::from_str(content)?)
}

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("mailmirror.toml"),
        xdg_config_dir().join("mailmirror").join("mailmirror.toml"),
    ]
}

fn load_config_text() -> Option<(PathBuf, String)> {
    for path in config_path_candidates() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Some((path, content));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{MirrorConfig, parse_config};

    #[test]
    fn empty_config_uses_defaults() -> anyhow::Result<()> {
        let config = parse_config("")?;
        assert_eq!(config.db_path, "maildb.sqlite");
        assert!(config.imap.is_none());
        assert!(config.require_imap().is_err());
        assert_eq!(config.default_mailbox(), "INBOX");
        Ok(())
    }

    #[test]
    fn full_config_round_trips_sections() -> anyhow::Result<()> {
        let config = parse_config(
            r#"
            db_path = "/var/lib/mailmirror/xen.sqlite"

            [imap]
            host = "imap.example.org"
            port = 143
            username = "lists"
            password = "hunter2"
            mailbox = "xen-devel"
            envelope_stride = 20

            [archive]
            path = "/srv/public-inbox/xen-devel"
            "#,
        )?;
        assert_eq!(config.db_path, "/var/lib/mailmirror/xen.sqlite");
        let imap = config.require_imap()?;
        assert_eq!(imap.port, 143);
        assert_eq!(imap.envelope_stride, 20);
        assert_eq!(config.default_mailbox(), "xen-devel");
        let archive = config
            .archive
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("archive section missing"))?;
        assert_eq!(archive.path, PathBuf::from("/srv/public-inbox/xen-devel"));
        assert_eq!(archive.duplicate_limit, 100);
        Ok(())
    }

    #[test]
    fn missing_required_key_is_named() {
        let err = parse_config(
            r#"
            [imap]
            host = "imap.example.org"
            username = "lists"
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("password"));
    }

    #[test]
    fn default_impl_matches_empty_file() -> anyhow::Result<()> {
        let parsed = parse_config("")?;
        let default = MirrorConfig::default();
        assert_eq!(parsed.db_path, default.db_path);
        Ok(())
    }
}
