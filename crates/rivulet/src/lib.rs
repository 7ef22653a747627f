//! rivulet - hosting shell for the `rivulet-cdc` engine
//!
//! Loads a YAML configuration, picks the checkpoint store and publisher it
//! names, and runs one monitor per configured table until shutdown.
//!
//! ```text
//! rivulet.yaml ──▶ RivuletConfig ──▶ SqlServerConnector ──▶ Orchestrator ──▶ Publisher
//!                                     (+ checkpoint store)                   (console | log)
//! ```

pub mod app;
pub mod config;
pub mod publisher;

pub use config::RivuletConfig;
