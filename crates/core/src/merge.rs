//! Union of polygon features that share a group key.
//!
//! The encoder buffers polygonal features while a merge rule is active and
//! hands them over here at the end of the tile. Each distinct combination of
//! `group_by` values becomes one output feature whose attributes come from the
//! first feature of the group.

use std::collections::HashMap;

use geo::{Geometry, MultiPolygon};
use i_overlay::core::overlay_rule::OverlayRule;

use crate::config::MergeRule;
use crate::mvt::{Properties, PropertyValue};
use crate::overlay;
use crate::property_filter::PropertyFilter;

/// A polygonal feature waiting to be merged.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeableFeature {
    /// Sequence number within the tile
    pub id: u64,
    pub properties: Properties,
    pub geometry: MultiPolygon<f64>,
}

/// Output of [`merge_features`]
#[derive(Debug, Clone, PartialEq)]
pub struct MergedFeature {
    pub properties: Properties,
    pub geometry: Geometry<f64>,
}

/// Group `features` by the rule's `group_by` values and union each group.
///
/// Features lacking one of the group keys are passed through on their own.
/// Groups are emitted in order of first appearance. Inputs are not modified.
pub fn merge_features(features: &[MergeableFeature], rule: &MergeRule) -> Vec<MergedFeature> {
    let filter = if rule.all_properties {
        PropertyFilter::None
    } else {
        PropertyFilter::include(rule.group_by.iter().chain(&rule.properties).cloned())
    };

    let mut groups: Vec<Vec<&MergeableFeature>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for feature in features {
        match group_key(&feature.properties, &rule.group_by) {
            Some(key) => match index.get(&key) {
                Some(&i) => groups[i].push(feature),
                None => {
                    index.insert(key, groups.len());
                    groups.push(vec![feature]);
                }
            },
            None => groups.push(vec![feature]),
        }
    }

    log::debug!("merged {} features into {} groups", features.len(), groups.len());

    groups
        .into_iter()
        .filter_map(|members| {
            let representative = members.first()?;
            let geometry = union_all(members.iter().map(|m| &m.geometry));
            if geometry.0.is_empty() {
                return None;
            }
            let geometry = if geometry.0.len() == 1 {
                Geometry::Polygon(geometry.0.into_iter().next()?)
            } else {
                Geometry::MultiPolygon(geometry)
            };
            Some(MergedFeature {
                properties: filter.apply(representative.properties.clone()),
                geometry,
            })
        })
        .collect()
}

fn group_key(properties: &Properties, group_by: &[String]) -> Option<String> {
    let values: Option<Vec<&PropertyValue>> = group_by
        .iter()
        .map(|key| properties.iter().find(|(k, _)| k == key).map(|(_, v)| v))
        .collect();
    values.map(|v| format!("{:?}", v))
}

fn union_all<'a>(parts: impl Iterator<Item = &'a MultiPolygon<f64>>) -> MultiPolygon<f64> {
    parts.fold(MultiPolygon::new(vec![]), |acc, part| {
        if acc.0.is_empty() {
            part.clone()
        } else {
            overlay::overlay(&acc, part, OverlayRule::Union)
        }
    })
}
