//! Attribute selection for encoded features.
//!
//! A collection's `properties` list turns into an include filter; merge
//! groups without all-properties mode keep only the group key and the
//! properties the merge rule names. Geometry is never affected.

use std::collections::HashSet;

use crate::mvt::Properties;

/// Which feature attributes end up in the tile.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PropertyFilter {
    /// Keep every attribute
    #[default]
    None,
    /// Keep only the named attributes
    Include(HashSet<String>),
    /// Drop the named attributes
    Exclude(HashSet<String>),
    /// Geometry only
    ExcludeAll,
}

impl PropertyFilter {
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Include(fields.into_iter().map(Into::into).collect())
    }

    pub fn exclude<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Exclude(fields.into_iter().map(Into::into).collect())
    }

    /// An include filter for a non-empty selection, otherwise no filtering.
    pub fn from_selection(fields: &[String]) -> Self {
        if fields.is_empty() {
            Self::None
        } else {
            Self::include(fields.iter().cloned())
        }
    }

    pub fn should_include(&self, field_name: &str) -> bool {
        match self {
            Self::None => true,
            Self::Include(whitelist) => whitelist.contains(field_name),
            Self::Exclude(blacklist) => !blacklist.contains(field_name),
            Self::ExcludeAll => false,
        }
    }

    /// Keep the matching attributes, preserving their order.
    pub fn apply(&self, properties: Properties) -> Properties {
        match self {
            Self::None => properties,
            Self::ExcludeAll => Vec::new(),
            _ => properties
                .into_iter()
                .filter(|(key, _)| self.should_include(key))
                .collect(),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Self::None)
    }
}
