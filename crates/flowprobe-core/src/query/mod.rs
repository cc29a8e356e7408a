//! Query execution: condition compiler, work discovery, parallel block evaluation, streaming
//! aggregation, and result sorting/top-N selection (§4.3, §4.4).

pub mod aggregator;
pub mod condition;
pub mod sort;
pub mod types;
pub mod workmanager;

pub use aggregator::execute_query;
pub use sort::sort_and_truncate;
pub use types::{Hits, Query, QueryResult, QueryStats, ResultRow, SortBy, Summary};
pub use workmanager::{build_workloads, Workload};
