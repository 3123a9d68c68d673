//! Replicated ordering engine.
//!
//! The agreement protocol itself lives in an external library; this
//! module defines the two-sided contract around it and the engine that
//! drives a real ledger through it:
//!
//! - [`Agreement`]: the surface the node consumes from the library
//! - [`AgreementHost`]: the surface the library calls back into,
//!   implemented by [`RbftAdaptor`]
//! - [`RbftNode`]: the engine wiring pool, timers, adaptor and library
//!   behind the uniform [`crate::ConsensusEngine`] contract

mod adaptor;
mod agreement;
mod node;

pub use adaptor::RbftAdaptor;
pub use agreement::{
    Agreement, AgreementHost, BatchProposal, ConfChange, ExecuteContext, ServiceState,
};
pub use node::RbftNode;
