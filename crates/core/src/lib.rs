pub mod config;
pub mod error;
pub mod params;
pub mod topology;

pub use config::Config;
pub use error::*;
pub use params::*;
pub use topology::*;
