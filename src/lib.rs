//! Drug-test printout OCR service
//!
//! This library turns a scanned point-of-care drug-test printout into a
//! per-panel verdict (THC, Cocaine, Opiates, ...) with a confidence score,
//! and persists the outcome against a test record. Scans are processed by a
//! bounded background worker pool; callers observe completion only through
//! the record's status.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
