//! Application layer: the master agent coordinating classification,
//! retrieval agents, session state, and the concept-set workflow.

pub mod master;

pub use master::MasterAgent;
