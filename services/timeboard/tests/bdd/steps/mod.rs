//! BDD step definitions for the timeboard service

pub mod cache_steps;
pub mod display_steps;
