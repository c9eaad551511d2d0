pub mod executor;
pub mod scheduler;
pub mod task_batch;
pub mod types;

pub use executor::*;
pub use scheduler::*;
pub use task_batch::*;
pub use types::*;
