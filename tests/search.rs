use std::sync::Mutex;

use assert_matches::assert_matches;

use s2_mosaic::archive::{ArchiveClient, DownloadResponse};
use s2_mosaic::error::MosaicError;
use s2_mosaic::geometry::Point;
use s2_mosaic::query::{CloudCoverRange, QueryParameters, SearchQuery, SpatialFilter};
use s2_mosaic::search::{SearchOutcome, search_all};

fn entry(index: usize, cloud: f64) -> String {
    format!(
        r#"<entry>
    <title>S2A_MSIL2A_20210812T094039_N0301_R036_T33TWJ_{index:015}</title>
    <link href="https://archive.example/odata/v1/Products('p{index}')/$value"/>
    <id>p{index}</id>
    <double name="cloudcoverpercentage">{cloud}</double>
  </entry>"#
    )
}

fn page(total: usize, entries: &[String]) -> String {
    format!(
        r#"<feed xmlns:opensearch="http://a9.com/-/spec/opensearch/1.1/" xmlns="http://www.w3.org/2005/Atom">
  <opensearch:totalResults>{total}</opensearch:totalResults>
  {}
</feed>"#,
        entries.concat()
    )
}

/// Serves `clouds` in pages; `truncate_at` drops everything from that offset on.
struct PagedArchive {
    total: usize,
    clouds: Vec<f64>,
    truncate_at: Option<usize>,
    requests: Mutex<Vec<QueryParameters>>,
}

impl PagedArchive {
    fn new(clouds: Vec<f64>) -> Self {
        Self {
            total: clouds.len(),
            clouds,
            truncate_at: None,
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl ArchiveClient for PagedArchive {
    fn search(&self, params: &QueryParameters) -> Result<String, MosaicError> {
        self.requests.lock().unwrap().push(params.clone());
        let start = params.start as usize;
        let end = (start + params.rows as usize).min(self.truncate_at.unwrap_or(self.total));
        let entries: Vec<String> = (start..end.max(start))
            .map(|index| entry(index, self.clouds[index]))
            .collect();
        Ok(page(self.total, &entries))
    }

    fn fetch_text(&self, uri: &str) -> Result<String, MosaicError> {
        Err(MosaicError::Data(format!("unexpected fetch {uri}")))
    }

    fn open_download(&self, uri: &str) -> Result<DownloadResponse, MosaicError> {
        Err(MosaicError::Data(format!("unexpected download {uri}")))
    }
}

fn query() -> SearchQuery {
    SearchQuery {
        product_type: "S2MSI2A".to_string(),
        time_window: "[NOW-30DAYS TO NOW]".to_string(),
        spatial_filter: SpatialFilter::Point(Point::new(15.5, 43.5)),
        cloud_cover: CloudCoverRange::default(),
        offset: 0,
        page_size: 2,
    }
}

#[test]
fn pages_are_fetched_until_total_and_ranked() {
    let archive = PagedArchive::new(vec![30.0, 10.0, 50.0, 10.0, 0.5]);
    let outcome = search_all(&archive, &query(), 2).unwrap();

    let starts: Vec<u32> = archive
        .requests
        .lock()
        .unwrap()
        .iter()
        .map(|params| params.start)
        .collect();
    assert_eq!(starts, [0, 2, 4]);

    let ids: Vec<&str> = outcome.entries().iter().map(|entry| entry.id.as_str()).collect();
    assert_eq!(ids, ["p4", "p1", "p3", "p0", "p2"]);
}

#[test]
fn zero_total_is_no_results_after_one_request() {
    let archive = PagedArchive::new(Vec::new());
    let outcome = search_all(&archive, &query(), 2).unwrap();
    assert_eq!(outcome, SearchOutcome::NoResults);
    assert_eq!(archive.requests.lock().unwrap().len(), 1);
}

#[test]
fn empty_page_before_total_stops_paging() {
    let mut archive = PagedArchive::new(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    archive.truncate_at = Some(2);
    let outcome = search_all(&archive, &query(), 2).unwrap();
    assert_eq!(outcome.entries().len(), 2);
    assert_eq!(archive.requests.lock().unwrap().len(), 2);
}

#[test]
fn every_page_carries_the_same_filter() {
    let archive = PagedArchive::new(vec![1.0, 2.0, 3.0]);
    search_all(&archive, &query(), 2).unwrap();
    let requests = archive.requests.lock().unwrap();
    assert!(requests.iter().all(|params| params.rows == 2));
    assert!(requests.iter().all(|params| params.q == requests[0].q));
    assert!(requests[0].q.contains("POINT"));
}

struct FailingArchive;

impl ArchiveClient for FailingArchive {
    fn search(&self, _params: &QueryParameters) -> Result<String, MosaicError> {
        Ok("<feed><error><code>500</code><message>Solr down</message></error></feed>".to_string())
    }

    fn fetch_text(&self, _uri: &str) -> Result<String, MosaicError> {
        unreachable!()
    }

    fn open_download(&self, _uri: &str) -> Result<DownloadResponse, MosaicError> {
        unreachable!()
    }
}

#[test]
fn remote_error_document_fails_search() {
    let err = search_all(&FailingArchive, &query(), 2).unwrap_err();
    assert_matches!(err, MosaicError::Remote { code, .. } if code == "500");
}
