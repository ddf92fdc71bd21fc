//! Macro for defining opaque handle types.

/// Defines a ULID-backed handle rendered as `{prefix}_{ulid}`.
///
/// Handles are compared by value only, so two ends of the same link can be
/// looked up in a map without touching the transport that backs them.
///
/// # Example
///
/// ```ignore
/// define_handle!(LinkId, "lnk");
///
/// let link = LinkId::issue();
/// let parsed: LinkId = link.to_string().parse()?;
/// ```
#[macro_export]
macro_rules! define_handle {
    ($name:ident, $prefix:literal) => {
        /// An opaque, system-issued handle.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// The prefix for this handle type.
            pub const PREFIX: &'static str = $prefix;

            /// Issues a new handle with a fresh ULID.
            #[must_use]
            pub fn issue() -> Self {
                Self($crate::Ulid::new())
            }

            /// Parses `{prefix}_{ulid}`; a handle of another kind is an
            /// [`InvalidPrefix`]($crate::IdError::InvalidPrefix) error.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                match s.split_once('_') {
                    _ if s.is_empty() => Err($crate::IdError::Empty),
                    None => Err($crate::IdError::MissingSeparator),
                    Some((prefix, _)) if prefix != Self::PREFIX => {
                        Err($crate::IdError::InvalidPrefix {
                            expected: Self::PREFIX,
                            actual: prefix.to_owned(),
                        })
                    }
                    Some((_, raw)) => raw
                        .parse::<$crate::Ulid>()
                        .map(Self)
                        .map_err(|e| $crate::IdError::InvalidUlid(e.to_string())),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
