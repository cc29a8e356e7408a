//! flowprobe-core — shared library for the flowprobe flow-capture and query ecosystem.
//!
//! Provides:
//! - `flowkey` — the 5-tuple flow key and counter value types
//! - `aggmap` — the open-addressed, seeded-hash flow hashmap (§4.1)
//! - `storage` — the column-partitioned on-disk store ("goDB", §4.2)
//! - `capture` — packet parsing, direction classification, and live capture management (§4.6)
//! - `query` — condition compiler, work manager, aggregator, and sort/top-N selection (§4.3, §4.4)
//! - `watchdog` — the heap watchdog (§4.5)
//! - `config` — YAML configuration loading (§2a)
//! - `time_parse` — the CLI time-expression grammar (§6)
//! - `error` — the shared error taxonomy (§7)

pub mod aggmap;
pub mod capture;
pub mod config;
pub mod error;
pub mod flowkey;
pub mod query;
pub mod storage;
pub mod time_parse;
pub mod watchdog;
