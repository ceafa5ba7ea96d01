pub mod config;
pub mod default_vals;
pub mod utils;

pub use config::Config;
