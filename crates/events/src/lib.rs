pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod projection;

pub use bus::{
    CommandPublisher, CommandSource, DeadLetter, DeadLetterSink, InboundRecord, PublishError,
    RecordError, RecordPosition, SourceError,
};
pub use envelope::{Action, CommandEnvelope, DecodeError, Payload};
pub use in_memory_bus::{InMemoryCommandLog, InMemoryCommandSource, InMemoryDeadLetters};
pub use projection::Projection;
