//! crmsim: staggered CRM record simulation
//!
//! Turns a simulation configuration (theme, industry, per-type record counts,
//! duration) into a time-ordered plan of create, associate and update steps,
//! then runs that plan against a CRM under a shared rate budget, resolving
//! placeholders to real record identifiers as creates succeed. Job progress is
//! persisted so an interrupted job can be resumed.

pub mod cli;
pub mod config;
pub mod content;
pub mod crm;
pub mod error;
pub mod executor;
pub mod logging;
pub mod plan;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod types;
