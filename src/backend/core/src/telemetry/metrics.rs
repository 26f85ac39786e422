//! Metric names and descriptions for the cache layer.
//!
//! Every counter is emitted through the `metrics` facade, so any recorder the
//! host process installs (Prometheus, StatsD, ...) picks them up.

use metrics::{describe_counter, describe_histogram, Unit};

pub const CACHE_HITS: &str = "cachet_cache_hits_total";
pub const CACHE_MISSES: &str = "cachet_cache_misses_total";
pub const CACHE_SETS: &str = "cachet_cache_sets_total";
pub const CACHE_DELETES: &str = "cachet_cache_deletes_total";
pub const CACHE_FLUSHES: &str = "cachet_cache_flushes_total";
pub const CACHE_OPERATIONS: &str = "cachet_cache_operations_total";
pub const CACHE_BYTES_STORED: &str = "cachet_cache_bytes_stored_total";
pub const CACHE_ENTRY_SIZE: &str = "cachet_cache_entry_size_bytes";
pub const STAMPEDE_WAITS: &str = "cachet_stampede_waits_total";
pub const STAMPEDE_FALLBACKS: &str = "cachet_stampede_fallbacks_total";
pub const EARLY_REFRESHES: &str = "cachet_early_refreshes_total";
pub const INVALIDATIONS: &str = "cachet_invalidations_total";
pub const WARM_TARGETS: &str = "cachet_warm_targets_total";
pub const RESPONSE_CACHE: &str = "cachet_response_cache_total";

/// Register all metric descriptions.
pub fn describe_metrics() {
    describe_counter!(CACHE_HITS, "Cache lookups that found a value");
    describe_counter!(CACHE_MISSES, "Cache lookups that found nothing");
    describe_counter!(CACHE_SETS, "Successful cache writes");
    describe_counter!(CACHE_DELETES, "Explicit cache deletes");
    describe_counter!(CACHE_FLUSHES, "Tag, pattern and full flushes");
    describe_counter!(CACHE_OPERATIONS, "Logical cache manager calls by operation");
    describe_counter!(CACHE_BYTES_STORED, Unit::Bytes, "Serialized bytes written to the backend");
    describe_histogram!(CACHE_ENTRY_SIZE, Unit::Bytes, "Size of serialized cache entries");
    describe_counter!(STAMPEDE_WAITS, "Callers that waited for another caller's regeneration");
    describe_counter!(STAMPEDE_FALLBACKS, "Waiters that gave up and regenerated themselves");
    describe_counter!(EARLY_REFRESHES, "Hits that triggered a probabilistic early refresh");
    describe_counter!(INVALIDATIONS, "Entries removed by invalidation policies and events");
    describe_counter!(WARM_TARGETS, "Warm targets executed, labelled by outcome");
    describe_counter!(RESPONSE_CACHE, "Responses through the cache layer, labelled by outcome");
}
