//! GeoJSON geometries
//!
//! Builders take coordinates in (latitude, longitude) order; the stored
//! form uses GeoJSON order, so `point(3.0, 7.0)` is written as
//! `{type: 'Point', coordinates: [7.0, 3.0]}`.
//!
//! ```ignore
//! let hole = [point(1.5, 2.0), point(1.9, 2.0), point(1.9, 1.8), point(1.5, 2.0)];
//! let polygon = polygon_builder([point(1.1, 2.0), point(2.3, 3.5), point(3.7, 1.0), point(1.1, 2.0)])
//!     .interior_ring(hole)
//!     .build()?;
//! ```

mod codec;

pub use codec::{from_bson, from_document, to_document};

use crate::{OdmError, Result};

/// A single position
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    latitude: f64,
    longitude: f64,
}

impl Point {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// GeoJSON position: `[longitude, latitude]`
    pub fn coordinates(&self) -> [f64; 2] {
        [self.longitude, self.latitude]
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LineString {
    points: Vec<Point>,
}

impl LineString {
    pub fn points(&self) -> &[Point] {
        &self.points
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiPoint {
    points: Vec<Point>,
}

impl MultiPoint {
    pub fn points(&self) -> &[Point] {
        &self.points
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiLineString {
    lines: Vec<LineString>,
}

impl MultiLineString {
    pub fn lines(&self) -> &[LineString] {
        &self.lines
    }
}

/// Exterior boundary plus holes; every ring is closed
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Polygon {
    exterior: Vec<Point>,
    interiors: Vec<Vec<Point>>,
}

impl Polygon {
    pub fn exterior(&self) -> &[Point] {
        &self.exterior
    }

    pub fn interiors(&self) -> &[Vec<Point>] {
        &self.interiors
    }

    /// Exterior ring first, then the holes in the order added
    pub fn rings(&self) -> impl Iterator<Item = &[Point]> {
        std::iter::once(self.exterior.as_slice()).chain(self.interiors.iter().map(Vec::as_slice))
    }

    pub(crate) fn from_rings(mut rings: Vec<Vec<Point>>) -> Result<Self> {
        if rings.is_empty() {
            return Err(OdmError::Geometry("polygon needs an exterior ring".to_string()));
        }
        for ring in &rings {
            check_ring(ring)?;
        }
        let exterior = rings.remove(0);
        Ok(Self {
            exterior,
            interiors: rings,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiPolygon {
    polygons: Vec<Polygon>,
}

impl MultiPolygon {
    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeometryCollection {
    geometries: Vec<Geometry>,
}

impl GeometryCollection {
    pub fn geometries(&self) -> &[Geometry] {
        &self.geometries
    }
}

/// Any geometry
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Point),
    LineString(LineString),
    MultiPoint(MultiPoint),
    MultiLineString(MultiLineString),
    Polygon(Polygon),
    MultiPolygon(MultiPolygon),
    GeometryCollection(GeometryCollection),
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry::Point(Point::default())
    }
}

impl Geometry {
    /// GeoJSON `type` tag
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "Point",
            Geometry::LineString(_) => "LineString",
            Geometry::MultiPoint(_) => "MultiPoint",
            Geometry::MultiLineString(_) => "MultiLineString",
            Geometry::Polygon(_) => "Polygon",
            Geometry::MultiPolygon(_) => "MultiPolygon",
            Geometry::GeometryCollection(_) => "GeometryCollection",
        }
    }
}

macro_rules! into_geometry {
    ($($ty:ident),+) => {$(
        impl From<$ty> for Geometry {
            fn from(value: $ty) -> Self {
                Geometry::$ty(value)
            }
        }
    )+};
}

into_geometry!(Point, LineString, MultiPoint, MultiLineString, Polygon, MultiPolygon, GeometryCollection);

fn check_ring(ring: &[Point]) -> Result<()> {
    match (ring.first(), ring.last()) {
        (Some(first), Some(last)) if ring.len() >= 3 && first == last => Ok(()),
        (Some(_), Some(_)) if ring.len() >= 3 => Err(OdmError::Geometry(format!(
            "ring is not closed: first point {:?} differs from last point {:?}",
            ring[0],
            ring[ring.len() - 1]
        ))),
        _ => Err(OdmError::Geometry(format!(
            "ring needs at least 3 points, got {}",
            ring.len()
        ))),
    }
}

// =====================
// Builders
// =====================

/// Point from (latitude, longitude)
pub fn point(latitude: f64, longitude: f64) -> Point {
    Point::new(latitude, longitude)
}

pub fn line_string(points: impl IntoIterator<Item = Point>) -> LineString {
    LineString {
        points: points.into_iter().collect(),
    }
}

pub fn multi_point(points: impl IntoIterator<Item = Point>) -> MultiPoint {
    MultiPoint {
        points: points.into_iter().collect(),
    }
}

pub fn multi_line_string(lines: impl IntoIterator<Item = LineString>) -> MultiLineString {
    MultiLineString {
        lines: lines.into_iter().collect(),
    }
}

pub fn multi_polygon(polygons: impl IntoIterator<Item = Polygon>) -> MultiPolygon {
    MultiPolygon {
        polygons: polygons.into_iter().collect(),
    }
}

/// Polygon without holes
pub fn polygon(exterior: impl IntoIterator<Item = Point>) -> Result<Polygon> {
    polygon_builder(exterior).build()
}

pub fn polygon_builder(exterior: impl IntoIterator<Item = Point>) -> PolygonBuilder {
    PolygonBuilder {
        exterior: exterior.into_iter().collect(),
        interiors: Vec::new(),
    }
}

pub fn geometry_collection(geometries: impl IntoIterator<Item = Geometry>) -> GeometryCollection {
    GeometryCollection {
        geometries: geometries.into_iter().collect(),
    }
}

pub fn geometry_collection_builder() -> GeometryCollectionBuilder {
    GeometryCollectionBuilder::default()
}

pub struct PolygonBuilder {
    exterior: Vec<Point>,
    interiors: Vec<Vec<Point>>,
}

impl PolygonBuilder {
    /// Add a hole; holes keep the order they are added in
    pub fn interior_ring(mut self, ring: impl IntoIterator<Item = Point>) -> Self {
        self.interiors.push(ring.into_iter().collect());
        self
    }

    /// # Errors
    /// Returns [`OdmError::Geometry`] if any ring has fewer than 3 points or
    /// is not closed.
    pub fn build(self) -> Result<Polygon> {
        let mut rings = Vec::with_capacity(self.interiors.len() + 1);
        rings.push(self.exterior);
        rings.extend(self.interiors);
        Polygon::from_rings(rings)
    }
}

#[derive(Default)]
pub struct GeometryCollectionBuilder {
    geometries: Vec<Geometry>,
}

impl GeometryCollectionBuilder {
    pub fn add(mut self, geometry: impl Into<Geometry>) -> Self {
        self.geometries.push(geometry.into());
        self
    }

    pub fn build(self) -> GeometryCollection {
        GeometryCollection {
            geometries: self.geometries,
        }
    }
}
