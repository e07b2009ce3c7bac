use crate::CommandEnvelope;

/// A projection builds a read model from the command log.
///
/// Projections implement the **CQRS read model pattern**: the write path only
/// appends envelopes, and a projection folds them into queryable state.
///
/// ## Idempotency
///
/// Delivery is at-least-once, so applying the same envelope twice in a row must
/// leave the read model exactly as applying it once:
///
/// - `create` overwrites the whole record (last write wins)
/// - `update` merges fields (re-merging the same fields is a no-op)
/// - `delete` removes the record (removing twice finds nothing the second time)
///
/// Any new action kind must keep this property or bring its own deduplication.
///
/// ## Persistence
///
/// This trait doesn't define how read models are stored. The pure in-memory
/// fold lives next to the domain types; the async, storage-backed variant
/// lives in the infrastructure layer.
pub trait Projection {
    /// Apply one envelope and return the number of records it touched
    /// (`0` means the target was absent).
    fn apply(&mut self, envelope: &CommandEnvelope) -> u64;

    /// Apply many envelopes in order.
    fn apply_all<'a>(&mut self, envelopes: impl IntoIterator<Item = &'a CommandEnvelope>)
    where
        Self: Sized,
    {
        for envelope in envelopes {
            self.apply(envelope);
        }
    }
}
