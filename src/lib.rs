//! draw-oracle - prediction-run orchestrator with adaptive strategy weighting
//!
//! This crate polls for published draw results, keeps a historical record and a
//! co-occurrence model over it, scores the ticket strategies against real
//! outcomes and generates the next weighted ticket batch.

pub mod config;
pub mod error;
pub mod oracle;
pub mod types;

// Re-export main types for convenience
pub use config::OracleConfig;
pub use error::{PipelineError, Severity};
pub use oracle::{OracleBuilder, Orchestrator};
pub use types::{DrawRecord, GeneratedTicket, NumberDomain};
