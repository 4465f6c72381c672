//! End-to-end tests across source, encoder, cache and combiner.
//!
//! These drive [`TileService`] and the cache manager the way a server would:
//! configuration in, tile bytes out, with real stores under a temp directory.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use geo::{point, polygon, Geometry};
    use prost::Message;

    use crate::cache::{MbtilesStore, TileCacheManager, TileSetKey};
    use crate::combine::Combiner;
    use crate::config::{
        CacheBackend, CollectionConfig, DatasetConfig, MergeRule, TilesConfig, ZoomRange,
    };
    use crate::mvt::{decode_tile, zigzag_encode, LayerBuilder, PropertyValue, TileBuilder};
    use crate::pipeline::{TileOrigin, TileService};
    use crate::source::{GeoJsonFeatureSource, SourceFeature};
    use crate::tile::{TileBounds, TileCoordinate, TilingScheme};
    use crate::vector_tile::{tile, Tile};
    use crate::Error;

    // ========== Fixtures ==========

    fn world_dataset(cache: CacheBackend) -> DatasetConfig {
        DatasetConfig {
            cache,
            ..Default::default()
        }
        .with_collection("pois", CollectionConfig::default())
    }

    fn center_lonlat(zoom: u8, row: u32, col: u32) -> (f64, f64) {
        let scheme = TilingScheme::WebMercatorQuad;
        let (x, y) = scheme.tile_bounds(zoom, row, col).center();
        scheme.unproject(x, y)
    }

    fn one_point_source(lon: f64, lat: f64) -> Arc<GeoJsonFeatureSource> {
        Arc::new(GeoJsonFeatureSource::new().with_features(
            "ds",
            "pois",
            vec![SourceFeature::new(Some("7"), Some(Geometry::Point(point!(x: lon, y: lat))))
                .with_property("name", PropertyValue::String("center".to_string()))],
        ))
    }

    fn single_layer(name: &str) -> Vec<u8> {
        let mut layer = LayerBuilder::new(name);
        layer.add_feature(Some(1), &Geometry::Point(point!(x: 10.0, y: 10.0)), &[]);
        let mut tile = TileBuilder::new();
        tile.add_layer(layer.build());
        tile.encode()
    }

    // ========== Single point at the tile center ==========

    #[test]
    fn test_center_point_tile() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            TilesConfig::new(dir.path()).with_dataset("ds", world_dataset(CacheBackend::FileTree)),
        );
        let (lon, lat) = center_lonlat(10, 5, 7);
        let service = TileService::new(config, one_point_source(lon, lat)).unwrap();
        let coord = TileCoordinate::new("ds", Some("pois"), "WebMercatorQuad", 10, 5, 7);

        assert!(!service.cache().exists(&coord));
        let served = service.get_tile(&coord).unwrap();
        assert_eq!(served.origin, TileOrigin::Generated);

        let raw = Tile::decode(served.data.as_slice()).unwrap();
        assert_eq!(raw.layers.len(), 1);
        let layer = &raw.layers[0];
        assert_eq!(layer.name, "pois");
        assert_eq!(layer.extent, Some(4096));
        assert_eq!(layer.features.len(), 1);

        let feature = &layer.features[0];
        assert_eq!(feature.id, Some(7));
        assert_eq!(feature.r#type, Some(tile::GeomType::Point as i32));
        // MoveTo(1) followed by one coordinate pair
        assert_eq!(
            feature.geometry,
            vec![9, zigzag_encode(2048), zigzag_encode(2048)]
        );

        // the written tile is what the next request gets
        assert_eq!(service.cache().read(&coord), Some(served.data));
    }

    #[test]
    fn test_center_point_tile_embedded_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            TilesConfig::new(dir.path()).with_dataset("ds", world_dataset(CacheBackend::Embedded)),
        );
        let (lon, lat) = center_lonlat(10, 5, 7);
        let service = TileService::new(config, one_point_source(lon, lat)).unwrap();
        let coord = TileCoordinate::new("ds", Some("pois"), "WebMercatorQuad", 10, 5, 7);

        let served = service.get_tile(&coord).unwrap();
        let container = MbtilesStore::container_path(dir.path(), &TileSetKey::for_coordinate(&coord));
        assert!(container.is_file());
        assert_eq!(service.get_tile(&coord).unwrap().origin, TileOrigin::Cache);

        let layers = decode_tile(&served.data).unwrap();
        assert_eq!(layers[0].features[0].geometry, Geometry::Point(point!(x: 2048.0, y: 2048.0)));
    }

    // ========== Purge ==========

    #[test]
    fn test_delete_range_outside_extent_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = DatasetConfig {
            extent: [5.0, 45.0, 15.0, 55.0],
            tile_sets: BTreeMap::from([("WebMercatorQuad".to_string(), ZoomRange::new(0, 8))]),
            ..Default::default()
        }
        .with_collection("pois", CollectionConfig::default());
        let config = Arc::new(TilesConfig::new(dir.path()).with_dataset("ds", dataset));
        let cache = TileCacheManager::new(dir.path(), config);

        let coord = TileCoordinate::new("ds", Some("pois"), "WebMercatorQuad", 4, 5, 8);
        cache.write(&coord, b"tile");

        let far_away = TileBounds::new(-120.0, -40.0, -110.0, -30.0);
        assert_eq!(cache.delete_range("ds", None, None, Some(&far_away)).unwrap(), 0);
        assert!(cache.exists(&coord));
    }

    // ========== Combining under concurrent generation ==========

    #[test]
    fn test_combine_waits_for_late_collection() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = DatasetConfig::default()
            .with_collection("buildings", CollectionConfig::default())
            .with_collection("roads", CollectionConfig::default());
        let config = Arc::new(TilesConfig::new(dir.path()).with_dataset("ds", dataset));
        let cache = Arc::new(TileCacheManager::new(dir.path(), config));

        let all = TileCoordinate::new("ds", None, "WebMercatorQuad", 6, 20, 30);
        let coords: BTreeMap<String, TileCoordinate> = ["buildings", "roads"]
            .into_iter()
            .map(|c| (c.to_string(), all.for_collection(c)))
            .collect();
        let initial = BTreeMap::from([
            ("roads".to_string(), Some(single_layer("roads"))),
            ("buildings".to_string(), None),
        ]);

        // another request finishes the buildings tile shortly after
        let writer = {
            let cache = Arc::clone(&cache);
            let coord = coords["buildings"].clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                cache.write(&coord, &single_layer("buildings"));
            })
        };

        let combined = Combiner::new(cache.as_ref())
            .with_backoff(Duration::from_millis(500))
            .combine(&coords, initial)
            .unwrap();
        writer.join().unwrap();

        assert!(combined.is_complete);
        assert!(combined.passes <= 2);
        let names: Vec<_> = decode_tile(&combined.data)
            .unwrap()
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, vec!["buildings", "roads"]);
    }

    #[test]
    fn test_corrupt_cached_layer_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = world_dataset(CacheBackend::FileTree)
            .with_collection("roads", CollectionConfig::default());
        let config = Arc::new(TilesConfig::new(dir.path()).with_dataset("ds", dataset));
        let (lon, lat) = center_lonlat(6, 20, 30);
        let service = TileService::new(config, one_point_source(lon, lat)).unwrap();

        let all = TileCoordinate::new("ds", None, "WebMercatorQuad", 6, 20, 30);
        let roads = all.for_collection("roads");
        // parses as protobuf, but the tag points at a value that does not exist
        let corrupt = Tile {
            layers: vec![tile::Layer {
                version: 2,
                name: "roads".to_string(),
                features: vec![tile::Feature {
                    id: None,
                    tags: vec![0, 3],
                    r#type: Some(tile::GeomType::Point as i32),
                    geometry: vec![9, 2, 2],
                }],
                keys: vec!["kind".to_string()],
                values: vec![],
                extent: Some(4096),
            }],
        }
        .encode_to_vec();
        service.cache().write(&roads, &corrupt);

        let err = service.get_tile(&all).unwrap_err();
        assert!(matches!(err, Error::TileDecode { retryable: false, .. }));
        assert!(!service.cache().exists(&roads));
        assert!(!service.cache().exists(&all));
    }

    #[test]
    fn test_garbage_cached_layer_is_deleted() {
        for backend in [CacheBackend::FileTree, CacheBackend::Embedded] {
            let dir = tempfile::tempdir().unwrap();
            let dataset = world_dataset(backend).with_collection("roads", CollectionConfig::default());
            let config = Arc::new(TilesConfig::new(dir.path()).with_dataset("ds", dataset));
            let (lon, lat) = center_lonlat(6, 20, 30);
            let source = GeoJsonFeatureSource::new()
                .with_features(
                    "ds",
                    "pois",
                    vec![SourceFeature::new(Some("7"), Some(Geometry::Point(point!(x: lon, y: lat))))],
                )
                .with_features("ds", "roads", Vec::new());
            let service = TileService::new(config, Arc::new(source)).unwrap();

            let all = TileCoordinate::new("ds", None, "WebMercatorQuad", 6, 20, 30);
            let roads = all.for_collection("roads");
            service.cache().write(&roads, b"garbage, not a protobuf tile");

            let err = service.get_tile(&all).unwrap_err();
            assert!(matches!(err, Error::TileDecode { retryable: false, .. }), "{backend:?}");
            assert!(!service.cache().exists(&roads), "{backend:?}");
            assert!(!service.cache().exists(&all), "{backend:?}");

            // the next request regenerates the layer
            let served = service.get_tile(&all).unwrap();
            assert!(served.is_complete, "{backend:?}");
        }
    }

    // ========== Merging ==========

    #[test]
    fn test_merged_landuse_through_service() {
        let dir = tempfile::tempdir().unwrap();
        let parcels = CollectionConfig {
            merge: vec![MergeRule {
                min_zoom: 0,
                max_zoom: 14,
                group_by: vec!["landuse".to_string()],
                properties: Vec::new(),
                all_properties: false,
            }],
            ..Default::default()
        };
        let dataset = DatasetConfig::default().with_collection("parcels", parcels);
        let config = Arc::new(TilesConfig::new(dir.path()).with_dataset("ds", dataset));

        let (lon, lat) = center_lonlat(12, 1300, 2100);
        let d = 0.01;
        let left = polygon![
            (x: lon - d, y: lat - d),
            (x: lon, y: lat - d),
            (x: lon, y: lat + d),
            (x: lon - d, y: lat + d),
        ];
        let right = polygon![
            (x: lon, y: lat - d),
            (x: lon + d, y: lat - d),
            (x: lon + d, y: lat + d),
            (x: lon, y: lat + d),
        ];
        let features = [left, right]
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                SourceFeature::new(Some(&i.to_string()), Some(Geometry::Polygon(p)))
                    .with_property("landuse", PropertyValue::String("forest".to_string()))
                    .with_property("owner", PropertyValue::Int(i as i64))
            })
            .collect();
        let source = Arc::new(GeoJsonFeatureSource::new().with_features("ds", "parcels", features));
        let service = TileService::new(config, source).unwrap();

        let coord = TileCoordinate::new("ds", Some("parcels"), "WebMercatorQuad", 12, 1300, 2100);
        let served = service.get_tile(&coord).unwrap();
        assert_eq!(served.stats.features_merged, 2);

        let layers = decode_tile(&served.data).unwrap();
        assert_eq!(layers[0].features.len(), 1);
        let merged = &layers[0].features[0];
        assert!(matches!(merged.geometry, Geometry::Polygon(_)));
        assert_eq!(
            merged.properties,
            vec![("landuse".to_string(), PropertyValue::String("forest".to_string()))]
        );
    }

    #[test]
    fn test_config_file_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (lon, lat) = center_lonlat(10, 5, 7);
        let geojson = format!(
            r#"{{"type": "FeatureCollection", "features": [
                {{"type": "Feature", "id": 3, "properties": {{"name": "x"}},
                  "geometry": {{"type": "Point", "coordinates": [{lon}, {lat}]}}}}
            ]}}"#
        );
        std::fs::write(dir.path().join("pois.geojson"), geojson).unwrap();
        let cache_root = dir.path().join("cache");
        let config_json = format!(
            r#"{{
                "cache_root": {:?},
                "datasets": {{
                    "ds": {{"collections": {{"pois": {{"features": "pois.geojson"}}}}}}
                }}
            }}"#,
            cache_root.display().to_string()
        );
        let config_path = dir.path().join("tiles.json");
        std::fs::write(&config_path, config_json).unwrap();

        let config = Arc::new(TilesConfig::from_path(&config_path).unwrap());
        let source = Arc::new(GeoJsonFeatureSource::from_config(&config).unwrap());
        let service = TileService::new(config, source).unwrap();

        let coord = TileCoordinate::new("ds", Some("pois"), "WebMercatorQuad", 10, 5, 7);
        let served = service.get_tile(&coord).unwrap();
        assert_eq!(decode_tile(&served.data).unwrap()[0].features[0].id, Some(3));
        assert!(Path::new(&cache_root).join("ds/pois/WebMercatorQuad/10/5/7.pbf").is_file());
    }
}
