// Geometry transform and tile encoding benchmarks
//
// Run with: cargo bench --package featuretiles-core --bench transform
//
// Inputs are synthetic so the suite runs without fixtures:
// - a dense polygon with a hole crossing the tile edge
// - a long wiggly line
// - a tile of 1K points through the full encoder

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use featuretiles_core::config::{ConfigLookup, DatasetConfig, TilesConfig, TilingParameters};
use featuretiles_core::encoder::TileEncoder;
use featuretiles_core::source::SourceFeature;
use featuretiles_core::tile::{TileCoordinate, TilingScheme};
use featuretiles_core::transform::TileTransform;
use geo::{Geometry, LineString, Point, Polygon};

const ZOOM: u8 = 12;
const ROW: u32 = 1400;
const COL: u32 = 2100;

/// Ring of `n` vertices around the tile center, `radius` tile widths wide.
fn ring(n: usize, radius: f64, wobble: f64) -> LineString<f64> {
    let bounds = TilingScheme::WebMercatorQuad.tile_bounds(ZOOM, ROW, COL);
    let (cx, cy) = bounds.center();
    let r = bounds.width() * radius;
    let mut coords: Vec<(f64, f64)> = (0..n)
        .map(|i| {
            let a = i as f64 / n as f64 * std::f64::consts::TAU;
            let rr = r * (1.0 + wobble * (a * 7.0).sin());
            (cx + rr * a.cos(), cy + rr * a.sin())
        })
        .collect();
    coords.push(coords[0]);
    LineString::from(coords)
}

fn bench_transform(c: &mut Criterion) {
    let scheme = TilingScheme::WebMercatorQuad;
    let params = TilingParameters::default();
    let transform = TileTransform::for_tile(scheme, ZOOM, ROW, COL, &params);

    let mut group = c.benchmark_group("transform");
    for vertices in [100usize, 1_000, 10_000] {
        let polygon = Geometry::Polygon(Polygon::new(
            ring(vertices, 0.7, 0.1),
            vec![ring(vertices / 4, 0.2, 0.05)],
        ));
        group.throughput(Throughput::Elements(vertices as u64));
        group.bench_with_input(BenchmarkId::new("polygon", vertices), &polygon, |b, geom| {
            b.iter(|| black_box(transform.apply(black_box(geom))))
        });

        let line = Geometry::LineString(ring(vertices, 0.45, 0.3));
        group.bench_with_input(BenchmarkId::new("line", vertices), &line, |b, geom| {
            b.iter(|| black_box(transform.apply(black_box(geom))))
        });
    }
    group.finish();
}

fn bench_encode_points(c: &mut Criterion) {
    let tile_set = TilesConfig::new("/unused")
        .with_dataset("ds", DatasetConfig::default())
        .tile_set("ds", None)
        .expect("dataset configured above");
    let coord = TileCoordinate::new("ds", Some("pois"), "WebMercatorQuad", ZOOM, ROW, COL);

    let bounds = TilingScheme::WebMercatorQuad.tile_bounds_crs84(ZOOM, ROW, COL);
    let features: Vec<SourceFeature> = (0..1_000)
        .map(|i| {
            let fx = (i % 40) as f64 / 40.0;
            let fy = (i / 40) as f64 / 25.0;
            let p = Point::new(
                bounds.min_x + fx * bounds.width(),
                bounds.min_y + fy * bounds.height(),
            );
            SourceFeature::new(Some(&i.to_string()), Some(Geometry::Point(p)))
        })
        .collect();

    let mut group = c.benchmark_group("encoder");
    group.throughput(Throughput::Elements(features.len() as u64));
    group.bench_function("points_1k", |b| {
        b.iter(|| {
            let mut encoder =
                TileEncoder::new("pois", &coord, TilingScheme::WebMercatorQuad, &tile_set);
            for feature in &features {
                encoder.add_feature(feature);
            }
            black_box(encoder.finish())
        })
    });
    group.finish();
}

criterion_group!(benches, bench_transform, bench_encode_points);
criterion_main!(benches);
