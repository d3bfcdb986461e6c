//! Integration tests for the CRM simulation engine

mod config_loading;
mod crm_http;
mod job_control;
mod job_lifecycle;
mod rate_budget;
mod recovery;
mod test_utils;
