pub mod applier;
pub mod artifacts;
pub mod atomicity;
pub mod auto_dedup;
pub mod candidates;
pub mod community;
pub mod convergence;
pub mod curator;
pub mod embedder;
pub mod graph;
pub mod index;
pub mod oracle;
pub mod report;
pub mod rounds;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;

pub use convergence::RunOutcome;
pub use curator::{Curator, RunOptions};
pub use report::RunReport;
