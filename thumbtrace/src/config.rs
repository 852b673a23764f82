//! Tunable constants the heuristics in this crate were hard-coded around upstream.

/// Knobs controlling the pipeline's heuristics.
///
/// Defaults reproduce the constants the original tool hard-codes; downstream consumers
/// that need to tune the heuristics for an unusual vendor can override them without
/// forking this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of fixed core-exception slots validated by the Vector Table Reader.
    pub vector_table_slot_count: usize,
    /// Byte offset the Vector Table Sizer gives up scanning past.
    pub max_vector_table_bytes: u32,
    /// Maximum number of instructions the reset-handler `.data` discovery pass scans
    /// forward before giving up.
    pub max_reset_scan_instructions: usize,
    /// How many 2-byte slots the GNU-thumb-helper gating `CMP` search walks backward.
    pub cmp_search_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vector_table_slot_count: 15,
            max_vector_table_bytes: 1024,
            max_reset_scan_instructions: 30,
            cmp_search_window: 10,
        }
    }
}
