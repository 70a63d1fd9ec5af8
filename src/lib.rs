pub mod config;
pub mod discretization;
pub mod error;
pub mod model;
pub mod models;
pub mod numerics;
pub mod physics;
pub mod processing;
