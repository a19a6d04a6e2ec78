//! Durable job model: the catalogue (`jobs.json`) and execution history
//! (`history.db`).

mod history;
mod store;
mod types;

pub use history::{HistoryEntry, HistoryQuery, HistoryStore, NewHistoryEntry, SortOrder};
pub use store::{find_by_ref, JobStore};
pub(crate) use types::normalize_tags;
pub use types::{
    lookup_ref_is_numeric, validate_name, Job, JobDraft, JobKind, JobPatch, JobStatus, LastResult,
    RunStatus,
};
