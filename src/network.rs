//! The monotone network-use policy gating which feeds may be fetched.

use serde::Deserialize;

/// Enumerated mode controlling permitted fetch activity.
///
/// Persisted in a preferences file by an external collaborator (see
/// [`crate::config`]); the driver only ever reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkUse {
    /// No network access is permitted; only cached/local feeds can be used.
    Offline,
    /// Network access is permitted, but local package-manager feeds are not
    /// proactively refreshed.
    Minimal,
    /// Unrestricted network access.
    Full,
}

impl NetworkUse {
    /// True for [`NetworkUse::Offline`].
    pub fn is_offline(self) -> bool {
        matches!(self, NetworkUse::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_from_lowercase_strings() {
        assert_eq!(
            toml::from_str::<NetworkUse>("\"offline\"").unwrap(),
            NetworkUse::Offline
        );
        assert_eq!(
            toml::from_str::<NetworkUse>("\"minimal\"").unwrap(),
            NetworkUse::Minimal
        );
        assert_eq!(
            toml::from_str::<NetworkUse>("\"full\"").unwrap(),
            NetworkUse::Full
        );
    }

    #[test]
    fn is_offline_only_true_for_offline() {
        assert!(NetworkUse::Offline.is_offline());
        assert!(!NetworkUse::Minimal.is_offline());
        assert!(!NetworkUse::Full.is_offline());
    }
}
