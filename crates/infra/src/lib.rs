//! Infrastructure layer: repositories, the job system and the funding job.

pub mod config;
pub mod funding;
pub mod jobs;
pub mod repository;

mod integration_tests;
