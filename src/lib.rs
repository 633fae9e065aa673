//! Leadflow: WhatsApp lead intake and automation core.

pub mod api;
pub mod audit;
pub mod automation;
pub mod config;
pub mod error;
pub mod gateway;
pub mod instances;
pub mod leads;
pub mod llm;
pub mod store;
pub mod webhook;
