use serde::{Deserialize, Serialize};

use crate::geometry::{Point, Polygon};

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum SpatialFilter {
    Point(Point),
    Polygon(Polygon),
}

impl SpatialFilter {
    pub fn to_wkt(&self) -> String {
        match self {
            SpatialFilter::Point(point) => point.to_wkt(),
            SpatialFilter::Polygon(polygon) => polygon.to_wkt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloudCoverRange {
    pub min: f64,
    pub max: f64,
}

impl Default for CloudCoverRange {
    fn default() -> Self {
        Self { min: 0.0, max: 100.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub product_type: String,
    pub time_window: String,
    pub spatial_filter: SpatialFilter,
    pub cloud_cover: CloudCoverRange,
    pub offset: u32,
    pub page_size: u32,
}

impl SearchQuery {
    pub fn at_offset(&self, offset: u32) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryParameters {
    pub q: String,
    pub rows: u32,
    pub start: u32,
}

impl QueryParameters {
    pub fn as_pairs(&self) -> [(&'static str, String); 3] {
        [
            ("q", self.q.clone()),
            ("rows", self.rows.to_string()),
            ("start", self.start.to_string()),
        ]
    }
}

pub fn build(query: &SearchQuery) -> QueryParameters {
    let q = format!(
        "producttype:{} AND beginposition:{} AND footprint:\"intersects({})\" AND cloudcoverpercentage:[{} TO {}]",
        query.product_type,
        query.time_window,
        query.spatial_filter.to_wkt(),
        query.cloud_cover.min,
        query.cloud_cover.max,
    );
    QueryParameters {
        q,
        rows: query.page_size,
        start: query.offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(filter: SpatialFilter) -> SearchQuery {
        SearchQuery {
            product_type: "S2MSI2A".to_string(),
            time_window: "[2021-08-01T00:00:00.000Z TO 2021-08-31T00:00:00.000Z]".to_string(),
            spatial_filter: filter,
            cloud_cover: CloudCoverRange { min: 0.0, max: 35.0 },
            offset: 20,
            page_size: 10,
        }
    }

    #[test]
    fn build_point_query() {
        let params = build(&query(SpatialFilter::Point(Point::new(16.2, 43.5))));
        assert_eq!(
            params.q,
            "producttype:S2MSI2A AND beginposition:[2021-08-01T00:00:00.000Z TO 2021-08-31T00:00:00.000Z] \
             AND footprint:\"intersects(POINT(16.2 43.5))\" AND cloudcoverpercentage:[0 TO 35]"
        );
        assert_eq!(params.rows, 10);
        assert_eq!(params.start, 20);
    }

    #[test]
    fn build_polygon_query() {
        let polygon = Polygon::rectangle(15.6, 43.74, 16.93, 44.65);
        let params = build(&query(SpatialFilter::Polygon(polygon)));
        assert!(params.q.contains(
            "footprint:\"intersects(POLYGON((15.6 43.74,16.93 43.74,16.93 44.65,15.6 44.65,15.6 43.74)))\""
        ));
    }

    #[test]
    fn offset_copy_keeps_everything_else() {
        let base = query(SpatialFilter::Point(Point::new(1.0, 2.0)));
        let next = base.at_offset(30);
        assert_eq!(next.offset, 30);
        assert_eq!(next.page_size, base.page_size);
        assert_eq!(build(&next).start, 30);
    }
}
