//! Long-running background loops.

pub mod command_consumer;

pub use command_consumer::{
    Applied, CommandConsumer, ConsumerSettings, ConsumerStats, LoopState, ProcessError, Step,
};
