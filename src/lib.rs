pub mod accountability;
pub mod cmr;
pub mod composite;
pub mod config;
pub mod domain;
pub mod duplicates;
pub mod error;
pub mod finding;
pub mod identity;
pub mod output;
