//! Task files: the static spec and the persisted status block.
//!
//! - [`spec`] - Parses the Goal / Task Type / Scope / Requirements / Definition of Done sections
//! - [`status`] - Renders, parses and relocates BLOCKED / COMPLETED / FAILED sections

pub mod spec;
pub mod status;

pub use spec::{slugify, TaskSpec};
pub use status::{
    current_marker, load_blocked_status, move_to_status_dir, parse_blocked_status,
    replace_status_block, strip_status_block, write_status, BlockedStatus, CompletionRecord,
    ExecutionHistory, FailureRecord, ResumeAttempt, ResumeOutcome, StatusMarker, StatusReport,
};
