//! GeoJSON wire form: `{type, coordinates}`, or `{type, geometries}` for
//! collections

use bson::{Bson, Document};

use super::{
    Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon, Point,
    Polygon,
};
use crate::codec::{bson_type_name, Decoder, Encoder, MappedValue};
use crate::mapping::ValueShape;
use crate::{OdmError, Result};

const TYPE_KEY: &str = "type";
const COORDINATES_KEY: &str = "coordinates";
const GEOMETRIES_KEY: &str = "geometries";

// =====================
// Encoding
// =====================

fn position(point: &Point) -> Bson {
    Bson::Array(point.coordinates().iter().map(|c| Bson::Double(*c)).collect())
}

fn positions(points: &[Point]) -> Bson {
    Bson::Array(points.iter().map(position).collect())
}

fn rings(polygon: &Polygon) -> Bson {
    Bson::Array(polygon.rings().map(positions).collect())
}

fn coordinates(geometry: &Geometry) -> Option<Bson> {
    Some(match geometry {
        Geometry::Point(point) => position(point),
        Geometry::LineString(line) => positions(line.points()),
        Geometry::MultiPoint(points) => positions(points.points()),
        Geometry::MultiLineString(lines) => {
            Bson::Array(lines.lines().iter().map(|line| positions(line.points())).collect())
        }
        Geometry::Polygon(polygon) => rings(polygon),
        Geometry::MultiPolygon(polygons) => Bson::Array(polygons.polygons().iter().map(rings).collect()),
        Geometry::GeometryCollection(_) => return None,
    })
}

/// Stored document for `geometry`
pub fn to_document(geometry: &Geometry) -> Document {
    let mut document = Document::new();
    document.insert(TYPE_KEY, geometry.type_name());
    match geometry {
        Geometry::GeometryCollection(collection) => {
            let members = collection
                .geometries()
                .iter()
                .map(|member| Bson::Document(to_document(member)))
                .collect::<Vec<_>>();
            document.insert(GEOMETRIES_KEY, members);
        }
        other => {
            if let Some(coordinates) = coordinates(other) {
                document.insert(COORDINATES_KEY, coordinates);
            }
        }
    }
    document
}

// =====================
// Decoding
// =====================

fn invalid(message: impl Into<String>) -> OdmError {
    OdmError::Geometry(message.into())
}

fn array<'v>(value: &'v Bson, what: &str) -> Result<&'v Vec<Bson>> {
    match value {
        Bson::Array(items) => Ok(items),
        other => Err(invalid(format!(
            "{} must be an array, got {}",
            what,
            bson_type_name(other)
        ))),
    }
}

fn number(value: &Bson) -> Result<f64> {
    match value {
        Bson::Double(f) => Ok(*f),
        Bson::Int32(n) => Ok(f64::from(*n)),
        Bson::Int64(n) => Ok(*n as f64),
        other => Err(invalid(format!(
            "coordinate must be a number, got {}",
            bson_type_name(other)
        ))),
    }
}

fn read_position(value: &Bson) -> Result<Point> {
    let items = array(value, "position")?;
    match items.as_slice() {
        [longitude, latitude, ..] => Ok(Point::new(number(latitude)?, number(longitude)?)),
        _ => Err(invalid(format!(
            "position needs longitude and latitude, got {} values",
            items.len()
        ))),
    }
}

fn read_positions(value: &Bson) -> Result<Vec<Point>> {
    array(value, "positions")?.iter().map(read_position).collect()
}

fn read_polygon(value: &Bson) -> Result<Polygon> {
    let rings = array(value, "polygon rings")?
        .iter()
        .map(read_positions)
        .collect::<Result<Vec<_>>>()?;
    Polygon::from_rings(rings)
}

/// Parse a stored geometry document
///
/// # Errors
/// Returns [`OdmError::Geometry`] for an unknown `type`, malformed
/// coordinates, or a polygon ring that is not closed.
pub fn from_document(document: &Document) -> Result<Geometry> {
    let kind = document
        .get_str(TYPE_KEY)
        .map_err(|_| invalid("geometry document has no string 'type'"))?;

    if kind == "GeometryCollection" {
        let members = document
            .get(GEOMETRIES_KEY)
            .ok_or_else(|| invalid("GeometryCollection has no 'geometries'"))?;
        let geometries = array(members, "geometries")?
            .iter()
            .map(from_bson)
            .collect::<Result<Vec<_>>>()?;
        return Ok(Geometry::GeometryCollection(GeometryCollection { geometries }));
    }

    let coordinates = document
        .get(COORDINATES_KEY)
        .ok_or_else(|| invalid(format!("{} has no 'coordinates'", kind)))?;
    let geometry = match kind {
        "Point" => Geometry::Point(read_position(coordinates)?),
        "LineString" => Geometry::LineString(LineString {
            points: read_positions(coordinates)?,
        }),
        "MultiPoint" => Geometry::MultiPoint(MultiPoint {
            points: read_positions(coordinates)?,
        }),
        "MultiLineString" => Geometry::MultiLineString(MultiLineString {
            lines: array(coordinates, "lines")?
                .iter()
                .map(|line| read_positions(line).map(|points| LineString { points }))
                .collect::<Result<Vec<_>>>()?,
        }),
        "Polygon" => Geometry::Polygon(read_polygon(coordinates)?),
        "MultiPolygon" => Geometry::MultiPolygon(MultiPolygon {
            polygons: array(coordinates, "polygons")?
                .iter()
                .map(read_polygon)
                .collect::<Result<Vec<_>>>()?,
        }),
        other => return Err(invalid(format!("unknown geometry type '{}'", other))),
    };
    Ok(geometry)
}

pub fn from_bson(value: &Bson) -> Result<Geometry> {
    match value {
        Bson::Document(document) => from_document(document),
        other => Err(invalid(format!(
            "geometry must be an object, got {}",
            bson_type_name(other)
        ))),
    }
}

// =====================
// Field codecs
// =====================

fn decode_geometry(value: Bson, dec: &mut Decoder<'_>) -> Result<Geometry> {
    match value {
        Bson::Document(document) => from_document(&document).map_err(|err| match err {
            OdmError::Geometry(message) => dec.error(message),
            other => other,
        }),
        other => Err(dec.unexpected("geometry", &other)),
    }
}

impl MappedValue for Geometry {
    fn shape() -> ValueShape {
        ValueShape::value::<Geometry>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::Document(to_document(self))))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        decode_geometry(value, dec)
    }
}

macro_rules! geometry_value {
    ($($ty:ident),+) => {$(
        impl MappedValue for $ty {
            fn shape() -> ValueShape {
                ValueShape::value::<$ty>()
            }

            fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
                Ok(Some(Bson::Document(to_document(&Geometry::$ty(self.clone())))))
            }

            fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
                match decode_geometry(value, dec)? {
                    Geometry::$ty(geometry) => Ok(geometry),
                    other => Err(dec.error(format!(
                        "expected {}, got {}",
                        stringify!($ty),
                        other.type_name()
                    ))),
                }
            }
        }
    )+};
}

geometry_value!(Point, LineString, MultiPoint, MultiLineString, Polygon, MultiPolygon, GeometryCollection);
