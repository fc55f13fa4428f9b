//! Shared fixtures for the end-to-end tests: a small website served
//! locally and helpers to set up a crawl workspace.

pub mod site;
pub mod workspace;
