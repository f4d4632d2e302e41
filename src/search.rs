use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, info, warn};

use crate::archive::ArchiveClient;
use crate::domain::{ProductEntry, parse_size, sort_by_cloud_cover};
use crate::error::MosaicError;
use crate::geometry::parse_wkt;
use crate::query::{SearchQuery, build};

#[derive(Debug, Clone, PartialEq)]
pub struct FeedPage {
    pub total_results: u64,
    pub entries: Vec<ProductEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    NoResults,
    Found(Vec<ProductEntry>),
}

impl SearchOutcome {
    pub fn entries(&self) -> &[ProductEntry] {
        match self {
            SearchOutcome::NoResults => &[],
            SearchOutcome::Found(entries) => entries,
        }
    }
}

pub fn search_all<C: ArchiveClient + ?Sized>(
    client: &C,
    template: &SearchQuery,
    page_size: u32,
) -> Result<SearchOutcome, MosaicError> {
    let page_size = page_size.max(1);
    let mut query = SearchQuery {
        offset: 0,
        page_size,
        ..template.clone()
    };

    let first = parse_feed(&client.search(&build(&query))?)?;
    let total = first.total_results;
    info!(total, page_size, "search returned");
    if total == 0 {
        return Ok(SearchOutcome::NoResults);
    }

    let mut entries = first.entries;
    let mut offset = u64::from(page_size);
    while offset < total {
        query = query.at_offset(offset as u32);
        debug!(offset, "fetching search page");
        let page = parse_feed(&client.search(&build(&query))?)?;
        if page.entries.is_empty() {
            warn!(offset, total, "archive returned an empty page before the reported total");
            break;
        }
        entries.extend(page.entries);
        offset += u64::from(page_size);
    }

    sort_by_cloud_cover(&mut entries);
    Ok(SearchOutcome::Found(entries))
}

#[derive(Default)]
struct EntryBuilder {
    id: Option<String>,
    title: Option<String>,
    link: Option<String>,
    size: Option<String>,
    begin: Option<String>,
    cloud_cover: Option<String>,
    relative_orbit: Option<String>,
    platform_id: Option<String>,
    orbit_direction: Option<String>,
    footprint: Option<String>,
}

impl EntryBuilder {
    fn set_field(&mut self, name: &str, value: String) {
        match name {
            "cloudcoverpercentage" => self.cloud_cover = Some(value),
            "relativeorbitnumber" => self.relative_orbit = Some(value),
            "beginposition" => self.begin = Some(value),
            "size" => self.size = Some(value),
            "footprint" => self.footprint = Some(value),
            "platformidentifier" => self.platform_id = Some(value),
            "orbitdirection" => self.orbit_direction = Some(value),
            _ => {}
        }
    }

    fn build(self) -> Result<ProductEntry, MosaicError> {
        let id = self
            .id
            .ok_or_else(|| MosaicError::Data("search entry without id".to_string()))?;
        let title = self
            .title
            .ok_or_else(|| MosaicError::Data(format!("search entry {id} without title")))?;
        let download_uri = self
            .link
            .ok_or_else(|| MosaicError::Data(format!("search entry {id} without link")))?;
        let cloud_cover = self
            .cloud_cover
            .ok_or_else(|| MosaicError::Data(format!("search entry {id} without cloud cover")))?
            .trim()
            .parse::<f64>()
            .map_err(|_| MosaicError::Data(format!("search entry {id} has invalid cloud cover")))?;
        let size_bytes = match self.size {
            Some(size) => parse_size(&size)?,
            None => 0,
        };
        let acquired_at = self
            .begin
            .as_deref()
            .map(|value| {
                DateTime::parse_from_rfc3339(value.trim())
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| MosaicError::Data(format!("invalid beginposition: {value}")))
            })
            .transpose()?;
        let relative_orbit = self
            .relative_orbit
            .as_deref()
            .and_then(|value| value.trim().parse::<u32>().ok());
        let footprint = match self.footprint.as_deref() {
            Some(wkt) => match parse_wkt(wkt) {
                Ok(geometry) => Some(geometry),
                Err(err) => {
                    warn!(id = %id, error = %err, "ignoring unparseable footprint");
                    None
                }
            },
            None => None,
        };
        Ok(ProductEntry {
            id,
            title: title.trim_end_matches(".SAFE").to_string(),
            download_uri,
            size_bytes,
            acquired_at,
            cloud_cover,
            relative_orbit,
            platform_id: self.platform_id,
            orbit_direction: self.orbit_direction,
            footprint,
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Capture {
    None,
    Total,
    Id,
    Title,
    Named,
    ErrorCode,
    ErrorMessage,
}

pub fn parse_feed(xml: &str) -> Result<FeedPage, MosaicError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut total_results = None;
    let mut entries = Vec::new();
    let mut current: Option<EntryBuilder> = None;
    let mut capture = Capture::None;
    let mut field_name = String::new();
    let mut text = String::new();
    let mut in_error = false;
    let mut error_code = None;
    let mut error_message = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.local_name();
                text.clear();
                capture = match name.as_ref() {
                    b"totalResults" => Capture::Total,
                    b"entry" => {
                        current = Some(EntryBuilder::default());
                        Capture::None
                    }
                    b"error" => {
                        in_error = true;
                        Capture::None
                    }
                    b"code" if in_error => Capture::ErrorCode,
                    b"message" if in_error => Capture::ErrorMessage,
                    b"id" if current.is_some() => Capture::Id,
                    b"title" if current.is_some() => Capture::Title,
                    b"str" | b"int" | b"double" | b"date" if current.is_some() => {
                        field_name = attribute(&e, b"name")?.unwrap_or_default();
                        Capture::Named
                    }
                    b"link" => {
                        link_into(&e, current.as_mut())?;
                        Capture::None
                    }
                    _ => Capture::None,
                };
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"link" {
                    link_into(&e, current.as_mut())?;
                }
            }
            Event::Text(t) => {
                if capture != Capture::None {
                    text.push_str(&t.unescape()?);
                }
            }
            Event::CData(t) => {
                if capture != Capture::None {
                    text.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Event::End(e) => {
                let value = std::mem::take(&mut text);
                match capture {
                    Capture::Total => {
                        total_results = Some(value.trim().parse::<u64>().map_err(|_| {
                            MosaicError::Data(format!("invalid totalResults: {value}"))
                        })?);
                    }
                    Capture::Id => {
                        if let Some(entry) = current.as_mut() {
                            entry.id = Some(value);
                        }
                    }
                    Capture::Title => {
                        if let Some(entry) = current.as_mut() {
                            entry.title = Some(value);
                        }
                    }
                    Capture::Named => {
                        if let Some(entry) = current.as_mut() {
                            entry.set_field(&field_name, value);
                        }
                    }
                    Capture::ErrorCode => error_code = Some(value),
                    Capture::ErrorMessage => error_message = Some(value),
                    Capture::None => {}
                }
                capture = Capture::None;
                if e.local_name().as_ref() == b"entry" {
                    if let Some(entry) = current.take() {
                        entries.push(entry.build()?);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if in_error {
        return Err(MosaicError::Remote {
            code: error_code.unwrap_or_else(|| "unknown".to_string()),
            message: error_message.unwrap_or_default(),
        });
    }

    let total_results = total_results
        .ok_or_else(|| MosaicError::Data("search response has no totalResults".to_string()))?;
    Ok(FeedPage {
        total_results,
        entries,
    })
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, MosaicError> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

// The download link is the `link` without a `rel` attribute.
fn link_into(e: &BytesStart<'_>, entry: Option<&mut EntryBuilder>) -> Result<(), MosaicError> {
    let Some(entry) = entry else {
        return Ok(());
    };
    if entry.link.is_some() || attribute(e, b"rel")?.is_some() {
        return Ok(());
    }
    entry.link = attribute(e, b"href")?;
    Ok(())
}
