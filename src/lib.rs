pub mod catalog;
pub mod normalization;
pub mod recon;
pub mod tracing;

pub mod util {
    pub mod env;
}
