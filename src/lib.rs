//! Managed-code debugger back-end.
//!
//! The crate drives a managed runtime through its inspection API
//! ([`debugger::runtime`]), serializes the runtime's asynchronous callbacks
//! through a single-consumer queue, keeps user breakpoints in sync with
//! dynamically loaded modules and exposes everything over the Debug Adapter
//! Protocol ([`dap`]).

pub mod dap;
pub mod debugger;
pub mod log;
