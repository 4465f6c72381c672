//! MVT (Mapbox Vector Tile) encoding and decoding.
//!
//! Key components:
//!
//! - **Zigzag encoding**: signed integers as unsigned varint-friendly values
//! - **Command encoding**: MoveTo / LineTo / ClosePath with delta coordinates
//! - **Layer encoding**: features with de-duplicated keys and values
//! - **Decoding**: the reverse direction, used to combine single-layer tiles
//!
//! Geometry handed to the encoder is in tile pixel space; it is multiplied by
//! a scale (`extent / tile_size`) and rounded to integer tile units.
//!
//! Reference: <https://github.com/mapbox/vector-tile-spec>

use std::collections::HashMap;

use geo::orient::{Direction, Orient};
use geo::{
    Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon,
};
use prost::Message;

use crate::validate::ring_signed_area;
use crate::vector_tile::tile::{Feature, GeomType, Layer, Value};
use crate::vector_tile::Tile;
use crate::{Error, Result};

/// Default tile extent (4096 as per MVT spec)
pub const DEFAULT_EXTENT: u32 = 4096;

/// MVT command IDs
const CMD_MOVE_TO: u32 = 1;
const CMD_LINE_TO: u32 = 2;
const CMD_CLOSE_PATH: u32 = 7;

// ============================================================================
// Zigzag Encoding
// ============================================================================

/// Encode a signed integer using zigzag encoding.
///
/// Small magnitudes map to small unsigned values:
/// 0 → 0, -1 → 1, 1 → 2, -2 → 3, 2 → 4, ...
#[inline]
pub fn zigzag_encode(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

/// Decode a zigzag-encoded unsigned integer back to signed.
#[inline]
pub fn zigzag_decode(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

// ============================================================================
// Command Encoding
// ============================================================================

/// Pack a command with a repeat count: `(command_id | (count << 3))`.
#[inline]
pub fn command_encode(command_id: u32, count: u32) -> u32 {
    (command_id & 0x7) | (count << 3)
}

/// Unpack a command into (command_id, count).
#[inline]
pub fn command_decode(command: u32) -> (u32, u32) {
    (command & 0x7, command >> 3)
}

// ============================================================================
// Geometry Encoding
// ============================================================================

/// Accumulates a command stream, tracking the cursor between commands.
struct CommandWriter {
    scale: f64,
    geometry: Vec<u32>,
    cursor: (i32, i32),
}

impl CommandWriter {
    fn new(scale: f64) -> Self {
        Self {
            scale,
            geometry: Vec::new(),
            cursor: (0, 0),
        }
    }

    fn to_tile(&self, c: &Coord<f64>) -> (i32, i32) {
        ((c.x * self.scale).round() as i32, (c.y * self.scale).round() as i32)
    }

    /// Integer vertices with repeated neighbours collapsed.
    fn vertices<'a>(&self, coords: impl Iterator<Item = &'a Coord<f64>>) -> Vec<(i32, i32)> {
        let mut out: Vec<(i32, i32)> = coords.map(|c| self.to_tile(c)).collect();
        out.dedup();
        out
    }

    fn push_point(&mut self, (x, y): (i32, i32)) {
        self.geometry.push(zigzag_encode(x - self.cursor.0));
        self.geometry.push(zigzag_encode(y - self.cursor.1));
        self.cursor = (x, y);
    }

    fn points(&mut self, points: &[(i32, i32)]) {
        if points.is_empty() {
            return;
        }
        self.geometry.push(command_encode(CMD_MOVE_TO, points.len() as u32));
        for &p in points {
            self.push_point(p);
        }
    }

    fn line(&mut self, vertices: &[(i32, i32)]) {
        let Some((&first, rest)) = vertices.split_first() else {
            return;
        };
        self.geometry.push(command_encode(CMD_MOVE_TO, 1));
        self.push_point(first);
        self.geometry.push(command_encode(CMD_LINE_TO, rest.len() as u32));
        for &p in rest {
            self.push_point(p);
        }
    }

    /// `vertices` excludes the closing point.
    fn ring(&mut self, vertices: &[(i32, i32)]) {
        self.line(vertices);
        self.geometry.push(command_encode(CMD_CLOSE_PATH, 1));
    }

    fn ring_vertices(&self, ring: &LineString<f64>) -> Option<Vec<(i32, i32)>> {
        let mut vertices = self.vertices(ring.0.iter());
        if vertices.len() > 1 && vertices.first() == vertices.last() {
            vertices.pop();
        }
        (vertices.len() >= 3).then_some(vertices)
    }

    fn polygon(&mut self, polygon: &Polygon<f64>) {
        // Exterior rings positive area in tile coordinates, holes negative
        let oriented = polygon.orient(Direction::Default);
        let Some(exterior) = self.ring_vertices(oriented.exterior()) else {
            return;
        };
        self.ring(&exterior);
        for interior in oriented.interiors() {
            if let Some(hole) = self.ring_vertices(interior) {
                self.ring(&hole);
            }
        }
    }

    fn finish(self) -> Vec<u32> {
        self.geometry
    }
}

/// Encode a geometry to MVT commands, scaling pixel coordinates by `scale`.
///
/// Returns an empty command list when nothing survives rounding.
pub fn encode_geometry(geom: &Geometry<f64>, scale: f64) -> (Vec<u32>, GeomType) {
    let mut writer = CommandWriter::new(scale);
    let geom_type = match geom {
        Geometry::Point(p) => {
            writer.points(&[writer.to_tile(&p.0)]);
            GeomType::Point
        }
        Geometry::MultiPoint(mp) => {
            let points: Vec<(i32, i32)> = mp.0.iter().map(|p| writer.to_tile(&p.0)).collect();
            writer.points(&points);
            GeomType::Point
        }
        Geometry::LineString(ls) => {
            encode_lines(&mut writer, std::slice::from_ref(ls));
            GeomType::Linestring
        }
        Geometry::MultiLineString(mls) => {
            encode_lines(&mut writer, &mls.0);
            GeomType::Linestring
        }
        Geometry::Polygon(poly) => {
            writer.polygon(poly);
            GeomType::Polygon
        }
        Geometry::MultiPolygon(mp) => {
            for poly in &mp.0 {
                writer.polygon(poly);
            }
            GeomType::Polygon
        }
        _ => GeomType::Unknown,
    };
    (writer.finish(), geom_type)
}

fn encode_lines(writer: &mut CommandWriter, lines: &[LineString<f64>]) {
    for line in lines {
        let vertices = writer.vertices(line.0.iter());
        if vertices.len() >= 2 {
            writer.line(&vertices);
        }
    }
}

// ============================================================================
// Properties
// ============================================================================

/// A property value that can be encoded in MVT.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Float(f32),
    Double(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
}

/// Ordered feature attributes
pub type Properties = Vec<(String, PropertyValue)>;

impl PropertyValue {
    /// Convert a JSON attribute; `null` has no MVT representation.
    ///
    /// Arrays and objects are carried as their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value as Json;
        match value {
            Json::Null => None,
            Json::Bool(b) => Some(PropertyValue::Bool(*b)),
            Json::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Some(PropertyValue::UInt(u))
                } else if let Some(i) = n.as_i64() {
                    Some(PropertyValue::Int(i))
                } else {
                    n.as_f64().map(PropertyValue::Double)
                }
            }
            Json::String(s) => Some(PropertyValue::String(s.clone())),
            other => Some(PropertyValue::String(other.to_string())),
        }
    }

    /// Convert to MVT Value type.
    pub fn to_mvt_value(&self) -> Value {
        match self {
            PropertyValue::String(s) => Value {
                string_value: Some(s.clone()),
                ..Default::default()
            },
            PropertyValue::Float(f) => Value {
                float_value: Some(*f),
                ..Default::default()
            },
            PropertyValue::Double(d) => Value {
                double_value: Some(*d),
                ..Default::default()
            },
            PropertyValue::Int(i) => Value {
                int_value: Some(*i),
                ..Default::default()
            },
            PropertyValue::UInt(u) => Value {
                uint_value: Some(*u),
                ..Default::default()
            },
            PropertyValue::Bool(b) => Value {
                bool_value: Some(*b),
                ..Default::default()
            },
        }
    }

    /// Convert back from an MVT Value; `None` if no field is set.
    pub fn from_mvt_value(value: &Value) -> Option<Self> {
        if let Some(s) = &value.string_value {
            Some(PropertyValue::String(s.clone()))
        } else if let Some(f) = value.float_value {
            Some(PropertyValue::Float(f))
        } else if let Some(d) = value.double_value {
            Some(PropertyValue::Double(d))
        } else if let Some(i) = value.int_value {
            Some(PropertyValue::Int(i))
        } else if let Some(u) = value.uint_value {
            Some(PropertyValue::UInt(u))
        } else if let Some(s) = value.sint_value {
            Some(PropertyValue::Int(s))
        } else {
            value.bool_value.map(PropertyValue::Bool)
        }
    }

    /// Field type name as declared in tile set metadata.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::String(_) => "String",
            PropertyValue::Bool(_) => "Boolean",
            _ => "Number",
        }
    }
}

// ============================================================================
// Layer / Tile Builders
// ============================================================================

/// Builder for encoding features into an MVT layer.
pub struct LayerBuilder {
    name: String,
    extent: u32,
    scale: f64,
    features: Vec<Feature>,
    keys: Vec<String>,
    key_index: HashMap<String, u32>,
    values: Vec<Value>,
    value_index: HashMap<String, u32>, // Debug repr of the value for dedup lookup
}

impl LayerBuilder {
    /// Create a new layer builder; geometry is taken as already in extent units.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extent: DEFAULT_EXTENT,
            scale: 1.0,
            features: Vec::new(),
            keys: Vec::new(),
            key_index: HashMap::new(),
            values: Vec::new(),
            value_index: HashMap::new(),
        }
    }

    /// Set the layer extent.
    pub fn with_extent(mut self, extent: u32) -> Self {
        self.extent = extent;
        self
    }

    /// Multiply incoming coordinates by `scale` before rounding.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    fn get_or_insert_key(&mut self, key: &str) -> u32 {
        if let Some(&idx) = self.key_index.get(key) {
            return idx;
        }
        let idx = self.keys.len() as u32;
        self.keys.push(key.to_string());
        self.key_index.insert(key.to_string(), idx);
        idx
    }

    fn get_or_insert_value(&mut self, value: &PropertyValue) -> u32 {
        let value_key = format!("{:?}", value);
        if let Some(&idx) = self.value_index.get(&value_key) {
            return idx;
        }
        let idx = self.values.len() as u32;
        self.values.push(value.to_mvt_value());
        self.value_index.insert(value_key, idx);
        idx
    }

    /// Add a feature to the layer.
    ///
    /// Returns `false` (and adds nothing) when the geometry encodes to no commands.
    pub fn add_feature(
        &mut self,
        id: Option<u64>,
        geometry: &Geometry<f64>,
        properties: &[(String, PropertyValue)],
    ) -> bool {
        let (commands, geom_type) = encode_geometry(geometry, self.scale);
        if commands.is_empty() || geom_type == GeomType::Unknown {
            return false;
        }

        let mut tags = Vec::with_capacity(properties.len() * 2);
        for (key, value) in properties {
            tags.push(self.get_or_insert_key(key));
            tags.push(self.get_or_insert_value(value));
        }

        self.features.push(Feature {
            id,
            tags,
            r#type: Some(geom_type as i32),
            geometry: commands,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Build the MVT Layer.
    pub fn build(self) -> Layer {
        Layer {
            version: 2,
            name: self.name,
            features: self.features,
            keys: self.keys,
            values: self.values,
            extent: Some(self.extent),
        }
    }
}

/// Builder for encoding multiple layers into an MVT tile.
#[derive(Default)]
pub struct TileBuilder {
    layers: Vec<Layer>,
}

impl TileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer; layers without features are left out.
    pub fn add_layer(&mut self, layer: Layer) {
        if !layer.features.is_empty() {
            self.layers.push(layer);
        }
    }

    pub fn build(self) -> Tile {
        Tile {
            layers: self.layers,
        }
    }

    /// Serialize the tile; a tile without layers encodes to zero bytes.
    pub fn encode(self) -> Vec<u8> {
        self.build().encode_to_vec()
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// A feature read back from a tile, geometry in extent units.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFeature {
    pub id: Option<u64>,
    pub geometry: Geometry<f64>,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLayer {
    pub name: String,
    pub extent: u32,
    pub features: Vec<DecodedFeature>,
}

fn structural(reason: impl Into<String>) -> Error {
    Error::TileDecode {
        retryable: false,
        reason: reason.into(),
    }
}

/// Decode an MVT buffer.
///
/// Protobuf errors are reported as retryable, since a buffer read while a
/// non-atomic writer is still busy looks truncated. Errors inside a
/// well-formed protobuf message are structural. Callers reading committed
/// cache entries treat every failure as structural.
pub fn decode_tile(data: &[u8]) -> Result<Vec<DecodedLayer>> {
    let tile = Tile::decode(data).map_err(|e| Error::TileDecode {
        retryable: true,
        reason: e.to_string(),
    })?;
    tile.layers.iter().map(decode_layer).collect()
}

fn decode_layer(layer: &Layer) -> Result<DecodedLayer> {
    let values = layer
        .values
        .iter()
        .map(|v| {
            PropertyValue::from_mvt_value(v)
                .ok_or_else(|| structural(format!("layer '{}': empty value", layer.name)))
        })
        .collect::<Result<Vec<_>>>()?;

    let features = layer
        .features
        .iter()
        .map(|f| decode_feature(f, &layer.keys, &values))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| match e {
            Error::TileDecode { retryable, reason } => Error::TileDecode {
                retryable,
                reason: format!("layer '{}': {reason}", layer.name),
            },
            other => other,
        })?;

    Ok(DecodedLayer {
        name: layer.name.clone(),
        extent: layer.extent.unwrap_or(DEFAULT_EXTENT),
        features,
    })
}

fn decode_feature(feature: &Feature, keys: &[String], values: &[PropertyValue]) -> Result<DecodedFeature> {
    if feature.tags.len() % 2 != 0 {
        return Err(structural("odd number of tag indices"));
    }
    let properties = feature
        .tags
        .chunks_exact(2)
        .map(|pair| {
            let key = keys.get(pair[0] as usize);
            let value = values.get(pair[1] as usize);
            match (key, value) {
                (Some(k), Some(v)) => Ok((k.clone(), v.clone())),
                _ => Err(structural(format!("dangling tag {}/{}", pair[0], pair[1]))),
            }
        })
        .collect::<Result<Properties>>()?;

    let geom_type = feature
        .r#type
        .and_then(|t| GeomType::try_from(t).ok())
        .unwrap_or(GeomType::Unknown);
    let geometry = decode_geometry(geom_type, &feature.geometry)?;

    Ok(DecodedFeature {
        id: feature.id,
        geometry,
        properties,
    })
}

/// Split a command stream into paths of absolute integer coordinates.
///
/// Each MoveTo starts a new path; the flag records a trailing ClosePath.
fn decode_paths(commands: &[u32]) -> Result<Vec<(Vec<Coord<f64>>, bool)>> {
    let mut paths: Vec<(Vec<Coord<f64>>, bool)> = Vec::new();
    let (mut x, mut y) = (0i32, 0i32);
    let mut i = 0;

    while i < commands.len() {
        let (id, count) = command_decode(commands[i]);
        i += 1;
        match id {
            CMD_MOVE_TO | CMD_LINE_TO => {
                let needed = count as usize * 2;
                if i + needed > commands.len() {
                    return Err(structural(format!(
                        "command {id} wants {count} points, stream ends early"
                    )));
                }
                for pair in commands[i..i + needed].chunks_exact(2) {
                    x = x.wrapping_add(zigzag_decode(pair[0]));
                    y = y.wrapping_add(zigzag_decode(pair[1]));
                    let c = Coord {
                        x: x as f64,
                        y: y as f64,
                    };
                    if id == CMD_MOVE_TO {
                        paths.push((vec![c], false));
                    } else {
                        match paths.last_mut() {
                            Some((path, false)) => path.push(c),
                            _ => return Err(structural("LineTo without MoveTo")),
                        }
                    }
                }
                i += needed;
            }
            CMD_CLOSE_PATH => match paths.last_mut() {
                Some((_, closed @ false)) => *closed = true,
                _ => return Err(structural("ClosePath without open path")),
            },
            other => return Err(structural(format!("unknown command {other}"))),
        }
    }

    Ok(paths)
}

/// Decode a command stream into a geometry in extent units.
pub fn decode_geometry(geom_type: GeomType, commands: &[u32]) -> Result<Geometry<f64>> {
    let paths = decode_paths(commands)?;
    if paths.is_empty() {
        return Err(structural("feature without geometry"));
    }

    match geom_type {
        GeomType::Point => {
            let mut points = Vec::with_capacity(paths.len());
            for (path, _) in paths {
                if path.len() != 1 {
                    return Err(structural("LineTo in point geometry"));
                }
                points.push(Point(path[0]));
            }
            Ok(if points.len() == 1 {
                Geometry::Point(points[0])
            } else {
                Geometry::MultiPoint(MultiPoint::new(points))
            })
        }
        GeomType::Linestring => {
            let mut lines = Vec::with_capacity(paths.len());
            for (path, _) in paths {
                if path.len() < 2 {
                    return Err(structural("linestring with fewer than 2 points"));
                }
                lines.push(LineString::new(path));
            }
            Ok(if lines.len() == 1 {
                Geometry::LineString(lines.remove(0))
            } else {
                Geometry::MultiLineString(MultiLineString::new(lines))
            })
        }
        GeomType::Polygon => decode_polygons(paths),
        GeomType::Unknown => Err(structural("unknown geometry type")),
    }
}

fn decode_polygons(paths: Vec<(Vec<Coord<f64>>, bool)>) -> Result<Geometry<f64>> {
    let mut polygons: Vec<(LineString<f64>, Vec<LineString<f64>>)> = Vec::new();

    for (mut path, closed) in paths {
        if !closed || path.len() < 3 {
            return Err(structural("polygon ring not closed"));
        }
        path.push(path[0]);
        let area = ring_signed_area(&path);
        let ring = LineString::new(path);
        if area > 0.0 {
            polygons.push((ring, Vec::new()));
        } else if area < 0.0 {
            match polygons.last_mut() {
                Some((_, holes)) => holes.push(ring),
                None => return Err(structural("polygon starts with an interior ring")),
            }
        }
        // zero-area rings carry nothing to draw
    }

    let mut polygons: Vec<Polygon<f64>> = polygons
        .into_iter()
        .map(|(exterior, holes)| Polygon::new(exterior, holes))
        .collect();
    match polygons.len() {
        0 => Err(structural("polygon without area")),
        1 => Ok(Geometry::Polygon(polygons.remove(0))),
        _ => Ok(Geometry::MultiPolygon(MultiPolygon::new(polygons))),
    }
}
