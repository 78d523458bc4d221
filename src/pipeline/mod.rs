pub mod builder;
pub mod runtime;
pub(crate) mod scorer_runtime;
pub mod stochastic;
pub mod traits;
