pub mod booster;
pub mod cart;
pub mod commands;
pub mod config;
pub mod cross_validation;
pub mod dataset;
pub mod error;
pub mod explainer;
pub mod features;
pub mod forest;
pub mod gaussian_process;
pub mod indicators;
pub mod metrics;
pub mod model;
pub mod models;
pub mod optimizer;
pub mod optimizer_status;
pub mod pipeline;
pub mod scaling;
pub mod search_space;
pub mod selection;
pub mod trainer;
pub mod tree;

pub use error::{PipelineError, Result};
