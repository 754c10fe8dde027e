//! The collector.
//!
//! - `control`: the concurrent cycle and the policy around it
//! - `degen`, `full`: stop-the-world fallbacks
//! - `marker`, `mark`, `satb`, `worklist`: concurrent marking
//! - `evac`, `oom`, `update_refs`: evacuation and reference updating
//! - `old`: old-generation marking and mixed-collection candidates
//! - `heuristics`: collection-set selection and triggers
//! - `verifier`: heap consistency checks

pub mod control;
pub mod degen;
pub(crate) mod evac;
pub(crate) mod full;
pub mod heuristics;
pub mod mark;
pub(crate) mod marker;
pub(crate) mod old;
pub mod oom;
pub mod satb;
pub mod state;
pub(crate) mod update_refs;
pub mod verifier;
pub mod worklist;
