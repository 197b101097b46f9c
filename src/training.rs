//! The local training step.

use crate::mask::ParameterSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What a training step needs to know about the round it runs in.
pub struct RoundConfig {
    /// The round the trained parameters belong to.
    pub round: u32,
    /// The zero-based iteration of the participant's round loop.
    pub iteration: u32,
    /// The number of passes over the local data.
    pub local_epochs: u32,
}

#[cfg_attr(test, mockall::automock)]
/// Trains a model on private data.
pub trait TrainingStep {
    /// Loads `params` into the model, trains it and returns the updated parameters.
    ///
    /// The returned parameters must keep the names and shapes of the given ones.
    fn train(&mut self, params: ParameterSet, config: &RoundConfig) -> anyhow::Result<ParameterSet>;
}
