//! searchgrid-placement — placement planner for SearchGrid.
//!
//! Given a project that needs indexing, selects which existing index and
//! node should receive it: existing assignments are stable, fallback
//! selection is deterministic (greatest free reserve, lowest id on ties).

pub mod planner;

pub use planner::{PlacementPlanner, rank_indices};
