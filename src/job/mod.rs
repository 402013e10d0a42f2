//! Job model: one unit of transfer work and its state machine
//!
//! A job is one file up or down, or one delete/restore sub-item. Jobs are
//! owned by exactly one [`JobQueue`](crate::queue::JobQueue); everything else
//! sees them through [`JobSnapshot`](transfer_protocol::JobSnapshot) copies.

mod model;
mod state;

pub use model::{derive_job_id, Job, JobTarget};
pub use state::can_transition;
