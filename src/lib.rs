//! News Reader - a small personal RSS/Atom feed reader
//!
//! Fetches the configured feeds, extracts their entries and shows them on a
//! web page. Settings and the feed list are edited through an HTML form and
//! kept in flat JSON files.

pub mod config;
pub mod feed;
pub mod fetcher;
pub mod routes;
pub mod store;
