pub mod error;
pub mod evolve;
pub mod executor;
pub mod fitness;
pub mod grade;
pub mod population;
pub mod space;

pub use error::{EvolveError, GenomeValidationError};
pub use evolve::{
    run_evolution, EngineState, EvolutionEngine, EvolutionOutcome, GenerationStats, RunControl,
    Termination,
};
pub use executor::{
    execute_with_retry, CallOutcome, ExecutionOutcome, Executor, ExecutorError, RetryPolicy,
};
pub use fitness::{score, ExampleSubset, FitnessEvaluator};
pub use grade::{grader_for, Grader};
pub use population::PopulationManager;
pub use space::GenomeSpace;
