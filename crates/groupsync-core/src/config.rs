use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::model::{CommunityGroupId, MirrorKind};

pub const DEFAULT_PAGE_SIZE: u64 = 25;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    pub enabled: bool,
    pub title: String,
    pub source: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            title: "Community Groups".to_string(),
            source: "Community Sync Container".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub page_size: u64,
    pub membership_source_prefix: String,
    pub access_source_prefix: String,
    pub access_title_suffix: String,
    pub container: ContainerConfig,
    pub lock_stale_after_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            membership_source_prefix: "Community Sync Group :".to_string(),
            access_source_prefix: "Community Sync Group ACL :".to_string(),
            access_title_suffix: ": Administrator".to_string(),
            container: ContainerConfig::default(),
            lock_stale_after_secs: 600,
        }
    }
}

impl SyncConfig {
    /// Parse a YAML document; missing keys fall back to defaults.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the document is malformed or invalid.
    pub fn from_yaml_str(raw: &str) -> Result<Self, SyncError> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|err| SyncError::Validation(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`SyncError::Validation`] for a zero page size or unusable source prefixes.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.page_size == 0 {
            return Err(SyncError::Validation(
                "page_size MUST be >= 1; use an unpaged run instead of 0".to_string(),
            ));
        }
        let membership = self.membership_source_prefix.trim();
        let access = self.access_source_prefix.trim();
        if membership.is_empty() || access.is_empty() {
            return Err(SyncError::Validation("source prefixes MUST be non-empty".to_string()));
        }
        if membership == access {
            return Err(SyncError::Validation("source prefixes MUST differ".to_string()));
        }
        if self.container.enabled && self.container.source.trim().is_empty() {
            return Err(SyncError::Validation(
                "container.source MUST be set when containerization is enabled".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn source_tag(&self, kind: MirrorKind, group: CommunityGroupId) -> String {
        match kind {
            MirrorKind::Membership => format!("{}{group}", self.membership_source_prefix),
            MirrorKind::AccessControl => format!("{}{group}", self.access_source_prefix),
        }
    }

    /// Recover the Community group a mirror was created for from its source tag.
    #[must_use]
    pub fn parse_source_tag(&self, source: &str) -> Option<(CommunityGroupId, MirrorKind)> {
        // Try the longer prefix first so one prefix being a prefix of the other stays unambiguous.
        let mut prefixes = [
            (self.membership_source_prefix.as_str(), MirrorKind::Membership),
            (self.access_source_prefix.as_str(), MirrorKind::AccessControl),
        ];
        prefixes.sort_by_key(|(prefix, _)| std::cmp::Reverse(prefix.len()));

        prefixes.iter().find_map(|(prefix, kind)| {
            let rest = source.strip_prefix(prefix)?;
            let id = rest.trim().parse::<u64>().ok()?;
            Some((CommunityGroupId(id), *kind))
        })
    }

    /// Access mirror title for a source title. A title that already carries the
    /// suffix keeps exactly one copy of it.
    #[must_use]
    pub fn access_title(&self, title: &str) -> String {
        let base = title.strip_suffix(self.access_title_suffix.as_str()).unwrap_or(title);
        format!("{base}{}", self.access_title_suffix)
    }
}
