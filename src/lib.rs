pub mod app;
pub mod archive;
pub mod checksum;
pub mod composite;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod geometry;
pub mod manifest;
pub mod output;
pub mod query;
pub mod raster;
pub mod retrieval;
pub mod search;
pub mod store;
pub mod tiles;
