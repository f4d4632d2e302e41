use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::MosaicError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn to_wkt(&self) -> String {
        format!("POINT({} {})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn of_points<'a>(points: impl IntoIterator<Item = &'a Point>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bbox = Self::new(first.x, first.y, first.x, first.y);
        for point in iter {
            bbox.min_x = bbox.min_x.min(point.x);
            bbox.min_y = bbox.min_y.min(point.y);
            bbox.max_x = bbox.max_x.max(point.x);
            bbox.max_y = bbox.max_y.max(point.y);
        }
        Some(bbox)
    }

    pub fn contains(&self, point: &Point) -> bool {
        point.x >= self.min_x && point.x <= self.max_x && point.y >= self.min_y && point.y <= self.max_y
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Polygon {
    pub exterior: Vec<Point>,
    pub holes: Vec<Vec<Point>>,
}

impl Polygon {
    pub fn new(exterior: Vec<Point>, holes: Vec<Vec<Point>>) -> Result<Self, MosaicError> {
        let exterior = close_ring(exterior)?;
        let holes = holes
            .into_iter()
            .map(close_ring)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { exterior, holes })
    }

    pub fn rectangle(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            exterior: vec![
                Point::new(min_x, min_y),
                Point::new(max_x, min_y),
                Point::new(max_x, max_y),
                Point::new(min_x, max_y),
                Point::new(min_x, min_y),
            ],
            holes: Vec::new(),
        }
    }

    pub fn bbox(&self) -> BoundingBox {
        // A constructed polygon always has at least four points.
        BoundingBox::of_points(&self.exterior).unwrap_or(BoundingBox::new(0.0, 0.0, 0.0, 0.0))
    }

    pub fn area(&self) -> f64 {
        let holes: f64 = self.holes.iter().map(|ring| signed_area(ring).abs()).sum();
        signed_area(&self.exterior).abs() - holes
    }

    pub fn centroid(&self) -> Point {
        let ring = &self.exterior;
        let area = signed_area(ring);
        if area.abs() < f64::EPSILON {
            let n = (ring.len() - 1).max(1) as f64;
            let (sx, sy) = ring[..ring.len() - 1]
                .iter()
                .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
            return Point::new(sx / n, sy / n);
        }
        let mut cx = 0.0;
        let mut cy = 0.0;
        for pair in ring.windows(2) {
            let cross = pair[0].x * pair[1].y - pair[1].x * pair[0].y;
            cx += (pair[0].x + pair[1].x) * cross;
            cy += (pair[0].y + pair[1].y) * cross;
        }
        Point::new(cx / (6.0 * area), cy / (6.0 * area))
    }

    pub fn contains_point(&self, point: &Point) -> bool {
        if !ring_contains(&self.exterior, point) {
            return false;
        }
        !self.holes.iter().any(|hole| ring_contains(hole, point))
    }

    pub fn intersects(&self, other: &Polygon) -> bool {
        if !self.bbox().intersects(&other.bbox()) {
            return false;
        }
        let rings_a = self.rings();
        let rings_b = other.rings();
        for ring_a in &rings_a {
            for ring_b in &rings_b {
                if rings_cross(ring_a, ring_b) {
                    return true;
                }
            }
        }
        // No boundary crossing: either disjoint or one fully inside the other.
        self.contains_point(&other.exterior[0]) || other.contains_point(&self.exterior[0])
    }

    pub fn to_wkt(&self) -> String {
        let mut out = String::from("POLYGON(");
        for (index, ring) in self.rings().iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            out.push('(');
            let coords = ring
                .iter()
                .map(|p| format!("{} {}", p.x, p.y))
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&coords);
            out.push(')');
        }
        out.push(')');
        out
    }

    fn rings(&self) -> Vec<&[Point]> {
        let mut rings = vec![self.exterior.as_slice()];
        rings.extend(self.holes.iter().map(|ring| ring.as_slice()));
        rings
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Geometry {
    Point(Point),
    Polygon(Polygon),
    MultiPolygon(Vec<Polygon>),
}

impl Geometry {
    pub fn polygons(&self) -> Vec<&Polygon> {
        match self {
            Geometry::Point(_) => Vec::new(),
            Geometry::Polygon(polygon) => vec![polygon],
            Geometry::MultiPolygon(polygons) => polygons.iter().collect(),
        }
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        match self {
            Geometry::Point(point) => Some(BoundingBox::new(point.x, point.y, point.x, point.y)),
            _ => self
                .polygons()
                .into_iter()
                .map(Polygon::bbox)
                .reduce(|acc, bbox| acc.union(&bbox)),
        }
    }

    pub fn intersects(&self, other: &Geometry) -> bool {
        match (self, other) {
            (Geometry::Point(a), Geometry::Point(b)) => a == b,
            (Geometry::Point(point), shape) | (shape, Geometry::Point(point)) => shape
                .polygons()
                .into_iter()
                .any(|polygon| polygon.contains_point(point)),
            _ => self.polygons().into_iter().any(|a| {
                other
                    .polygons()
                    .into_iter()
                    .any(|b| a.intersects(b))
            }),
        }
    }

    pub fn centroid(&self) -> Option<Point> {
        match self {
            Geometry::Point(point) => Some(*point),
            _ => self
                .polygons()
                .into_iter()
                .max_by(|a, b| a.area().total_cmp(&b.area()))
                .map(Polygon::centroid),
        }
    }

    pub fn to_wkt(&self) -> String {
        match self {
            Geometry::Point(point) => point.to_wkt(),
            Geometry::Polygon(polygon) => polygon.to_wkt(),
            Geometry::MultiPolygon(polygons) => {
                let parts = polygons
                    .iter()
                    .map(|p| p.to_wkt().trim_start_matches("POLYGON").to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                format!("MULTIPOLYGON({parts})")
            }
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wkt())
    }
}

fn close_ring(mut ring: Vec<Point>) -> Result<Vec<Point>, MosaicError> {
    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
        if first != last {
            ring.push(first);
        }
    }
    if ring.len() < 4 {
        return Err(MosaicError::Data(format!(
            "polygon ring needs at least 3 distinct points, got {}",
            ring.len().saturating_sub(1)
        )));
    }
    Ok(ring)
}

fn signed_area(ring: &[Point]) -> f64 {
    ring.windows(2)
        .map(|pair| pair[0].x * pair[1].y - pair[1].x * pair[0].y)
        .sum::<f64>()
        / 2.0
}

// Even-odd ray cast; points on the boundary count as inside.
fn ring_contains(ring: &[Point], point: &Point) -> bool {
    let mut inside = false;
    for pair in ring.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if on_segment(&a, &b, point) {
            return true;
        }
        if (a.y > point.y) != (b.y > point.y) {
            let x_at = a.x + (point.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if point.x < x_at {
                inside = !inside;
            }
        }
    }
    inside
}

fn rings_cross(a: &[Point], b: &[Point]) -> bool {
    a.windows(2).any(|edge_a| {
        b.windows(2)
            .any(|edge_b| segments_intersect(&edge_a[0], &edge_a[1], &edge_b[0], &edge_b[1]))
    })
}

fn orientation(a: &Point, b: &Point, c: &Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn on_segment(a: &Point, b: &Point, p: &Point) -> bool {
    orientation(a, b, p).abs() < 1e-12
        && p.x >= a.x.min(b.x)
        && p.x <= a.x.max(b.x)
        && p.y >= a.y.min(b.y)
        && p.y <= a.y.max(b.y)
}

fn segments_intersect(p1: &Point, p2: &Point, q1: &Point, q2: &Point) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    on_segment(q1, q2, p1) || on_segment(q1, q2, p2) || on_segment(p1, p2, q1) || on_segment(p1, p2, q2)
}

pub fn parse_wkt(text: &str) -> Result<Geometry, MosaicError> {
    let mut parser = WktParser::new(text);
    let tag = parser.word()?.to_ascii_uppercase();
    let geometry = match tag.as_str() {
        "POINT" => {
            parser.expect('(')?;
            let point = parser.point()?;
            parser.expect(')')?;
            Geometry::Point(point)
        }
        "POLYGON" => Geometry::Polygon(parser.polygon()?),
        "MULTIPOLYGON" => {
            parser.expect('(')?;
            let mut polygons = vec![parser.polygon()?];
            while parser.eat(',') {
                polygons.push(parser.polygon()?);
            }
            parser.expect(')')?;
            Geometry::MultiPolygon(polygons)
        }
        other => {
            return Err(MosaicError::Data(format!("unsupported WKT geometry: {other}")));
        }
    };
    parser.finish()?;
    Ok(geometry)
}

struct WktParser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> WktParser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn skip_ws(&mut self) {
        while let Some(ch) = self.text[self.pos..].chars().next() {
            if !ch.is_whitespace() {
                break;
            }
            self.pos += ch.len_utf8();
        }
    }

    fn error(&self, what: &str) -> MosaicError {
        MosaicError::Data(format!("invalid WKT at offset {}: expected {what}", self.pos))
    }

    fn word(&mut self) -> Result<&'a str, MosaicError> {
        self.skip_ws();
        let start = self.pos;
        let rest = &self.text[start..];
        let len = rest
            .find(|ch: char| !ch.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.error("geometry type"));
        }
        self.pos += len;
        Ok(&self.text[start..self.pos])
    }

    fn eat(&mut self, ch: char) -> bool {
        self.skip_ws();
        if self.text[self.pos..].starts_with(ch) {
            self.pos += ch.len_utf8();
            return true;
        }
        false
    }

    fn expect(&mut self, ch: char) -> Result<(), MosaicError> {
        if self.eat(ch) {
            Ok(())
        } else {
            Err(self.error(&format!("'{ch}'")))
        }
    }

    fn number(&mut self) -> Result<f64, MosaicError> {
        self.skip_ws();
        let rest = &self.text[self.pos..];
        let len = rest
            .find(|ch: char| !(ch.is_ascii_digit() || matches!(ch, '-' | '+' | '.' | 'e' | 'E')))
            .unwrap_or(rest.len());
        let value = rest[..len]
            .parse::<f64>()
            .map_err(|_| self.error("number"))?;
        self.pos += len;
        Ok(value)
    }

    fn point(&mut self) -> Result<Point, MosaicError> {
        let x = self.number()?;
        let y = self.number()?;
        // Tolerate a trailing Z/M ordinate.
        self.skip_ws();
        if self.text[self.pos..].starts_with(|ch: char| ch.is_ascii_digit() || ch == '-') {
            self.number()?;
        }
        Ok(Point::new(x, y))
    }

    fn ring(&mut self) -> Result<Vec<Point>, MosaicError> {
        self.expect('(')?;
        let mut points = vec![self.point()?];
        while self.eat(',') {
            points.push(self.point()?);
        }
        self.expect(')')?;
        Ok(points)
    }

    fn polygon(&mut self) -> Result<Polygon, MosaicError> {
        self.expect('(')?;
        let exterior = self.ring()?;
        let mut holes = Vec::new();
        while self.eat(',') {
            holes.push(self.ring()?);
        }
        self.expect(')')?;
        Polygon::new(exterior, holes)
    }

    fn finish(&mut self) -> Result<(), MosaicError> {
        self.skip_ws();
        if self.pos != self.text.len() {
            return Err(self.error("end of input"));
        }
        Ok(())
    }
}

pub fn geometry_from_geojson(value: &Value) -> Result<Geometry, MosaicError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| MosaicError::Data("GeoJSON geometry without type".to_string()))?;
    let coordinates = value
        .get("coordinates")
        .ok_or_else(|| MosaicError::Data(format!("GeoJSON {kind} without coordinates")))?;
    match kind {
        "Point" => Ok(Geometry::Point(json_position(coordinates)?)),
        "Polygon" => Ok(Geometry::Polygon(json_polygon(coordinates)?)),
        "MultiPolygon" => {
            let parts = coordinates
                .as_array()
                .ok_or_else(|| MosaicError::Data("MultiPolygon coordinates".to_string()))?
                .iter()
                .map(json_polygon)
                .collect::<Result<Vec<_>, _>>()?;
            if parts.is_empty() {
                return Err(MosaicError::Data("empty MultiPolygon".to_string()));
            }
            Ok(Geometry::MultiPolygon(parts))
        }
        other => Err(MosaicError::Data(format!(
            "unsupported GeoJSON geometry: {other}"
        ))),
    }
}

fn json_position(value: &Value) -> Result<Point, MosaicError> {
    let coords = value
        .as_array()
        .filter(|coords| coords.len() >= 2)
        .ok_or_else(|| MosaicError::Data("GeoJSON position needs two numbers".to_string()))?;
    let x = coords[0]
        .as_f64()
        .ok_or_else(|| MosaicError::Data("GeoJSON x is not a number".to_string()))?;
    let y = coords[1]
        .as_f64()
        .ok_or_else(|| MosaicError::Data("GeoJSON y is not a number".to_string()))?;
    Ok(Point::new(x, y))
}

fn json_polygon(value: &Value) -> Result<Polygon, MosaicError> {
    let rings = value
        .as_array()
        .filter(|rings| !rings.is_empty())
        .ok_or_else(|| MosaicError::Data("GeoJSON polygon without rings".to_string()))?;
    let mut parsed = rings
        .iter()
        .map(|ring| {
            ring.as_array()
                .ok_or_else(|| MosaicError::Data("GeoJSON ring is not an array".to_string()))?
                .iter()
                .map(json_position)
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;
    let exterior = parsed.remove(0);
    Polygon::new(exterior, parsed)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_polygon_wkt_closes_and_reads_holes() {
        let geometry =
            parse_wkt("POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0), (2 2, 4 2, 4 4, 2 4))").unwrap();
        let Geometry::Polygon(polygon) = geometry else {
            panic!("expected polygon");
        };
        assert_eq!(polygon.exterior.len(), 5);
        assert_eq!(polygon.holes[0].len(), 5);
        assert!(!polygon.contains_point(&Point::new(3.0, 3.0)));
        assert!(polygon.contains_point(&Point::new(6.0, 6.0)));
    }

    #[test]
    fn parse_multipolygon_and_point() {
        let geometry = parse_wkt(
            "MULTIPOLYGON(((15 43, 16 43, 16 44, 15 43)),((17 43, 18 43, 18 44, 17 43)))",
        )
        .unwrap();
        assert_eq!(geometry.polygons().len(), 2);

        let point = parse_wkt("POINT(16.2 43.5)").unwrap();
        assert_eq!(point, Geometry::Point(Point::new(16.2, 43.5)));
    }

    #[test]
    fn reject_garbage_wkt() {
        assert_matches!(parse_wkt("LINESTRING(0 0, 1 1)"), Err(MosaicError::Data(_)));
        assert_matches!(parse_wkt("POLYGON((0 0, 1 1))"), Err(MosaicError::Data(_)));
        assert_matches!(parse_wkt("POINT(1 2) trailing"), Err(MosaicError::Data(_)));
    }

    #[test]
    fn polygons_intersect_on_overlap_containment_and_touch() {
        let a = Polygon::rectangle(0.0, 0.0, 10.0, 10.0);
        let overlapping = Polygon::rectangle(5.0, 5.0, 15.0, 15.0);
        let inside = Polygon::rectangle(2.0, 2.0, 3.0, 3.0);
        let touching = Polygon::rectangle(10.0, 0.0, 20.0, 10.0);
        let disjoint = Polygon::rectangle(11.0, 11.0, 12.0, 12.0);

        assert!(a.intersects(&overlapping));
        assert!(a.intersects(&inside));
        assert!(inside.intersects(&a));
        assert!(a.intersects(&touching));
        assert!(!a.intersects(&disjoint));
    }

    #[test]
    fn centroid_of_rectangle() {
        let centroid = Polygon::rectangle(10.0, 40.0, 12.0, 44.0).centroid();
        assert!((centroid.x - 11.0).abs() < 1e-9);
        assert!((centroid.y - 42.0).abs() < 1e-9);
    }

    #[test]
    fn geojson_polygon_with_elevation() {
        let value = serde_json::json!({
            "type": "Polygon",
            "coordinates": [[[15.6, 43.7, 0.0], [16.9, 43.7, 0.0], [16.9, 44.6, 0.0], [15.6, 44.6, 0.0]]]
        });
        let geometry = geometry_from_geojson(&value).unwrap();
        let bbox = geometry.bbox().unwrap();
        assert_eq!(bbox.min_x, 15.6);
        assert_eq!(bbox.max_y, 44.6);
    }
}
