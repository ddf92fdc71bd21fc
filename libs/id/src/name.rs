//! Validated device names.

use std::borrow::Borrow;
use std::fmt;

use crate::IdError;

/// Maximum length of a device name in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// Unique, operator-chosen name of a logical device.
///
/// Names are ASCII: letters, digits and `-`, `_`, `.`, `/`. The `/` is used
/// by composite devices to name their children (`beam0/rx3`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceName(String);

impl DeviceName {
    /// Validates and wraps a name.
    pub fn new(name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IdError::Empty);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(IdError::TooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }
        if let Some(ch) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')))
        {
            return Err(IdError::InvalidCharacter { name, ch });
        }
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DeviceName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Borrow<str> for DeviceName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for DeviceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for DeviceName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DeviceName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_names() {
        for name in ["rx0", "beam-former.2", "segment_A/rx3"] {
            assert_eq!(DeviceName::new(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn test_rejects_empty_and_spaces() {
        assert!(DeviceName::new("").unwrap_err().is_empty());
        assert!(matches!(
            DeviceName::new("rx 0").unwrap_err(),
            IdError::InvalidCharacter { ch: ' ', .. }
        ));
    }

    #[test]
    fn test_rejects_too_long() {
        let long = "a".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            DeviceName::new(long).unwrap_err(),
            IdError::TooLong { .. }
        ));
    }

    #[test]
    fn test_json_rejects_invalid() {
        let result: Result<DeviceName, _> = serde_json::from_str("\"bad name\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_borrow_lookup() {
        let mut map = std::collections::HashMap::new();
        map.insert(DeviceName::new("rx0").unwrap(), 1);
        assert_eq!(map.get("rx0"), Some(&1));
    }

    proptest! {
        #[test]
        fn prop_allowed_alphabet_always_accepted(name in "[A-Za-z0-9_./-]{1,128}") {
            prop_assert!(DeviceName::new(name).is_ok());
        }
    }
}
