use transfer_protocol::JobStatus;

/// Legal status changes. Everything not listed here is rejected.
///
/// Failed and Stopped are the only states that may go back to Waiting, and
/// only through an explicit retry or resume. Verifying may drop back to
/// Running once, when a failed integrity check sends the data again.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Waiting, Running)
            | (Waiting, Duplicated)
            | (Waiting, Stopped)
            | (Running, Verifying)
            | (Running, Finished)
            | (Running, Failed)
            | (Running, Stopped)
            | (Running, Duplicated)
            | (Verifying, Running)
            | (Verifying, Finished)
            | (Verifying, Failed)
            | (Verifying, Stopped)
            | (Failed, Waiting)
            | (Stopped, Waiting)
    )
}
