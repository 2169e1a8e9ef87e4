use crate::pipeline::Record;

/// Per-record reshaping applied before indexing.
///
/// Implementations must be pure: the streaming runtime re-runs batches
/// after failures. Any `Fn(Record) -> Record` closure works.
pub trait Transform: Send + Sync {
    fn apply(&self, record: Record) -> Record;
}

impl<F> Transform for F
where
    F: Fn(Record) -> Record + Send + Sync,
{
    fn apply(&self, record: Record) -> Record {
        self(record)
    }
}

/// Field-for-field copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transform for Identity {
    fn apply(&self, record: Record) -> Record {
        record
    }
}
