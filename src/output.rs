use std::io::{self, Write};

use crossterm::QueueableCommand;
use crossterm::cursor::MoveToColumn;
use crossterm::style::{Print, Stylize};
use crossterm::terminal::{Clear, ClearType};
use serde::Serialize;

use crate::app::{
    MosaicResult, ProgressEvent, ProgressSink, RunReport, SearchResult, TileStatus, TilesResult,
};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_tiles(result: &TilesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_search(result: &SearchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_mosaic(result: &MosaicResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Default)]
pub struct ConsoleOutput;

impl ConsoleOutput {
    fn draw(event: &ProgressEvent) -> io::Result<()> {
        let mut stderr = io::stderr();
        stderr.queue(MoveToColumn(0))?.queue(Clear(ClearType::CurrentLine))?;
        match (event.percent, event.elapsed) {
            (Some(percent), _) => {
                stderr.queue(Print(format!("{} {percent:>3}%", event.message).cyan()))?;
                if percent == 100 {
                    stderr.queue(Print("\n"))?;
                }
            }
            (None, Some(elapsed)) => {
                stderr.queue(Print(
                    format!("{} ({} ms)\n", event.message, elapsed.as_millis()).green(),
                ))?;
            }
            (None, None) => {
                stderr.queue(Print(format!("{}\n", event.message)))?;
            }
        }
        stderr.flush()
    }

    pub fn print_run_summary(report: &RunReport) {
        println!("{}", "s2-mosaic summary".cyan());
        for tile in &report.tiles {
            let line = match tile.status {
                TileStatus::Composite => format!(
                    "  {} composite {} (cloud {:.1}%)",
                    tile.tile,
                    tile.composite.as_deref().unwrap_or("-"),
                    tile.cloud_cover.unwrap_or_default()
                )
                .green(),
                TileStatus::NoResults => format!("  {} no search results", tile.tile).yellow(),
                TileStatus::NoMatchingProduct => format!(
                    "  {} no suitable product among {} candidate(s)",
                    tile.tile, tile.candidates
                )
                .yellow(),
                TileStatus::Failed => format!(
                    "  {} failed: {}",
                    tile.tile,
                    tile.error.as_deref().unwrap_or("unknown error")
                )
                .red(),
            };
            println!("{line}");
            for band in tile.bands.iter().filter(|band| band.error.is_some()) {
                println!(
                    "{}",
                    format!(
                        "    {} failed: {}",
                        band.band,
                        band.error.as_deref().unwrap_or_default()
                    )
                    .red()
                );
            }
        }
        match (&report.mosaic, &report.mosaic_error) {
            (Some(mosaic), _) => println!(
                "{}",
                format!(
                    "mosaic {} ({}x{}, EPSG:{}) from {} composite(s)",
                    mosaic.output, mosaic.width, mosaic.height, mosaic.epsg, mosaic.inputs
                )
                .green()
            ),
            (None, Some(err)) => println!("{}", format!("mosaic failed: {err}").red()),
            (None, None) => println!("{}", "no composites, mosaic skipped".yellow()),
        }
    }

    pub fn print_tiles(result: &TilesResult) {
        for tile in &result.tiles {
            println!(
                "{} EPSG:{} POINT({} {})",
                tile.tile, tile.epsg, tile.centroid_lon, tile.centroid_lat
            );
        }
    }

    pub fn print_search(result: &SearchResult) {
        for candidate in &result.candidates {
            let marker = if result.selected.as_deref() == Some(candidate.title.as_str()) {
                "*"
            } else {
                " "
            };
            println!(
                "{marker} {:>6.2}% {:>12} {}",
                candidate.cloud_cover, candidate.size_bytes, candidate.title
            );
        }
        if result.selected.is_none() {
            println!("{}", format!("no suitable product for tile {}", result.tile).yellow());
        }
    }
}

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        // Drawing is best effort.
        let _ = Self::draw(&event);
    }
}
