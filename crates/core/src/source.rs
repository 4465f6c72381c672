//! Feature sources feeding the tile encoder.
//!
//! A [`FeatureSource`] answers a [`FeatureQuery`] with a single-pass stream of
//! features. The stream is lazy; the encoder pulls from it one feature at a
//! time and stops as soon as the query's [`CancellationToken`] fires.
//!
//! [`GeoJsonFeatureSource`] keeps GeoJSON FeatureCollections in memory and is
//! what the CLI serves from.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use geo::{BoundingRect, Geometry};
use geojson::feature::Id;
use geojson::GeoJson;

use crate::config::TilesConfig;
use crate::mvt::{Properties, PropertyValue};
use crate::property_filter::PropertyFilter;
use crate::tile::TileBounds;
use crate::{Error, Result};

/// Shared flag telling producers and consumers that the client went away.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One feature as delivered by a source, geometry in CRS84.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFeature {
    pub id: Option<String>,
    pub properties: Properties,
    pub geometry: Option<Geometry<f64>>,
}

impl SourceFeature {
    pub fn new(id: Option<&str>, geometry: Option<Geometry<f64>>) -> Self {
        Self {
            id: id.map(str::to_string),
            properties: Vec::new(),
            geometry,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.push((key.into(), value));
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Features of one collection intersecting a bbox.
#[derive(Debug, Clone)]
pub struct FeatureQuery {
    pub dataset: String,
    pub collection: String,
    /// CRS84 spatial filter
    pub bbox: Option<TileBounds>,
    /// Attributes to return; empty means all
    pub properties: Vec<String>,
    pub limit: Option<usize>,
    pub cancel: CancellationToken,
}

impl FeatureQuery {
    pub fn new(dataset: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            collection: collection.into(),
            bbox: None,
            properties: Vec::new(),
            limit: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_bbox(mut self, bbox: TileBounds) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_properties(mut self, properties: Vec<String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Lazy, non-restartable feature sequence
pub type FeatureStream = Box<dyn Iterator<Item = Result<SourceFeature>> + Send>;

/// Anything that can answer feature queries.
pub trait FeatureSource: Send + Sync {
    /// Start a query. Failing to reach the backend is an [`Error::Query`].
    fn query(&self, query: &FeatureQuery) -> Result<FeatureStream>;
}

/// In-memory source built from GeoJSON FeatureCollections.
#[derive(Debug, Default)]
pub struct GeoJsonFeatureSource {
    collections: HashMap<(String, String), Arc<Vec<SourceFeature>>>,
}

impl GeoJsonFeatureSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every collection that names a `features` file.
    pub fn from_config(config: &TilesConfig) -> Result<Self> {
        let mut source = Self::new();
        for (dataset_id, dataset) in &config.datasets {
            for (collection_id, collection) in &dataset.collections {
                if let Some(path) = &collection.features {
                    source.load_file(dataset_id, collection_id, path)?;
                }
            }
        }
        Ok(source)
    }

    pub fn load_file(&mut self, dataset: &str, collection: &str, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        self.load_str(dataset, collection, &text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn load_str(&mut self, dataset: &str, collection: &str, text: &str) -> Result<()> {
        let geojson: GeoJson = text
            .parse()
            .map_err(|e: geojson::Error| Error::Config(format!("invalid GeoJSON: {e}")))?;
        let features = match geojson {
            GeoJson::FeatureCollection(fc) => fc.features,
            GeoJson::Feature(f) => vec![f],
            GeoJson::Geometry(_) => {
                return Err(Error::Config("expected a Feature or FeatureCollection".to_string()))
            }
        };

        let converted: Vec<SourceFeature> = features.into_iter().map(convert_feature).collect();
        log::debug!("loaded {} features for {dataset}/{collection}", converted.len());
        self.insert(dataset, collection, converted);
        Ok(())
    }

    pub fn insert(&mut self, dataset: &str, collection: &str, features: Vec<SourceFeature>) {
        self.collections
            .insert((dataset.to_string(), collection.to_string()), Arc::new(features));
    }

    pub fn with_features(mut self, dataset: &str, collection: &str, features: Vec<SourceFeature>) -> Self {
        self.insert(dataset, collection, features);
        self
    }
}

fn convert_feature(feature: geojson::Feature) -> SourceFeature {
    let id = feature.id.map(|id| match id {
        Id::String(s) => s,
        Id::Number(n) => n.to_string(),
    });
    let properties = feature
        .properties
        .unwrap_or_default()
        .iter()
        .filter_map(|(key, value)| PropertyValue::from_json(value).map(|v| (key.clone(), v)))
        .collect();
    let geometry = feature.geometry.and_then(|g| match Geometry::<f64>::try_from(g) {
        Ok(geom) => Some(geom),
        Err(e) => {
            log::warn!("skipping unsupported geometry of feature {id:?}: {e}");
            None
        }
    });
    SourceFeature {
        id,
        properties,
        geometry,
    }
}

impl FeatureSource for GeoJsonFeatureSource {
    fn query(&self, query: &FeatureQuery) -> Result<FeatureStream> {
        let features = self
            .collections
            .get(&(query.dataset.clone(), query.collection.clone()))
            .cloned()
            .ok_or_else(|| Error::Query(format!("no features for {}/{}", query.dataset, query.collection)))?;

        Ok(Box::new(GeoJsonStream {
            features,
            next: 0,
            emitted: 0,
            bbox: query.bbox,
            filter: PropertyFilter::from_selection(&query.properties),
            limit: query.limit,
            cancel: query.cancel.clone(),
            done: false,
        }))
    }
}

struct GeoJsonStream {
    features: Arc<Vec<SourceFeature>>,
    next: usize,
    emitted: usize,
    bbox: Option<TileBounds>,
    filter: PropertyFilter,
    limit: Option<usize>,
    cancel: CancellationToken,
    done: bool,
}

impl GeoJsonStream {
    fn matches(&self, feature: &SourceFeature) -> bool {
        let Some(bbox) = &self.bbox else {
            return true;
        };
        // Features without geometry pass through; the encoder skips them
        let Some(rect) = feature.geometry.as_ref().and_then(|g| g.bounding_rect()) else {
            return true;
        };
        let bounds = TileBounds::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y);
        bounds.intersection(bbox).is_some()
    }
}

impl Iterator for GeoJsonStream {
    type Item = Result<SourceFeature>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Some(Err(Error::Cancelled));
        }
        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            return None;
        }
        while let Some(feature) = self.features.get(self.next) {
            self.next += 1;
            if self.matches(feature) {
                self.emitted += 1;
                let mut out = feature.clone();
                out.properties = self.filter.apply(out.properties);
                return Some(Ok(out));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::point;

    const ROADS: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "id": 1, "properties": {"name": "A1", "lanes": 2, "note": null},
             "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0]]}},
            {"type": "Feature", "id": "b", "properties": {"name": "B2"},
             "geometry": {"type": "Point", "coordinates": [50.0, 50.0]}},
            {"type": "Feature", "properties": {"name": "ghost"}, "geometry": null}
        ]
    }"#;

    fn source() -> GeoJsonFeatureSource {
        let mut source = GeoJsonFeatureSource::new();
        source.load_str("ds", "roads", ROADS).unwrap();
        source
    }

    fn collect(stream: FeatureStream) -> Vec<SourceFeature> {
        stream.map(|f| f.unwrap()).collect()
    }

    #[test]
    fn test_load_geojson_features() {
        let features = collect(source().query(&FeatureQuery::new("ds", "roads")).unwrap());
        assert_eq!(features.len(), 3);
        assert_eq!(features[0].id.as_deref(), Some("1"));
        assert_eq!(features[1].id.as_deref(), Some("b"));
        assert!(features[2].geometry.is_none());
        // null attributes are dropped
        assert_eq!(features[0].properties.len(), 2);
        assert_eq!(features[0].property("lanes"), Some(&PropertyValue::UInt(2)));
    }

    #[test]
    fn test_bbox_filter() {
        let query = FeatureQuery::new("ds", "roads").with_bbox(TileBounds::new(40.0, 40.0, 60.0, 60.0));
        let features = collect(source().query(&query).unwrap());
        // the point plus the geometry-less feature
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].id.as_deref(), Some("b"));
    }

    #[test]
    fn test_limit_and_field_selection() {
        let query = FeatureQuery::new("ds", "roads")
            .with_limit(Some(1))
            .with_properties(vec!["lanes".to_string()]);
        let features = collect(source().query(&query).unwrap());
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].properties, vec![("lanes".to_string(), PropertyValue::UInt(2))]);
    }

    #[test]
    fn test_cancelled_stream_yields_error() {
        let token = CancellationToken::new();
        let query = FeatureQuery::new("ds", "roads").with_cancellation(token.clone());
        let mut stream = source().query(&query).unwrap();
        assert!(stream.next().unwrap().is_ok());
        token.cancel();
        assert!(matches!(stream.next(), Some(Err(Error::Cancelled))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_unknown_collection_is_query_error() {
        let err = source().query(&FeatureQuery::new("ds", "rivers")).err().unwrap();
        assert!(matches!(err, Error::Query(_)));
    }

    #[test]
    fn test_in_memory_features() {
        let source = GeoJsonFeatureSource::new().with_features(
            "ds",
            "pois",
            vec![SourceFeature::new(Some("7"), Some(Geometry::Point(point!(x: 1.0, y: 2.0))))
                .with_property("kind", PropertyValue::String("cafe".to_string()))],
        );
        let features = collect(source.query(&FeatureQuery::new("ds", "pois")).unwrap());
        assert_eq!(features[0].property("kind"), Some(&PropertyValue::String("cafe".to_string())));
    }
}
