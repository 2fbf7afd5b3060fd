//! Mock collaborators, an in-memory workflow service, and fixtures shared by
//! the Weft test suites.

mod fixtures;
mod mocks;
mod workflows;

pub use fixtures::*;
pub use mocks::*;
pub use workflows::InMemoryWorkflowService;
