//! Chat export with a concurrent chunked media downloader.

pub mod config;
pub mod dates;
pub mod download;
pub mod exporter;
pub mod fetch;
pub mod media;
