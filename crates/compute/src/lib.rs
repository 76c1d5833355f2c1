pub mod discord;
pub mod engine;
pub mod error;
pub mod reconstruction;
pub mod series;

pub use discord::DiscordEngine;
pub use engine::AnomalyEngine;
pub use error::ComputeError;
pub use reconstruction::{
    reconstruct, reconstruct_all, reconstruct_to_length, ReconstructedScoreSeries, ReductionMode,
    WindowedScoreSeries,
};
pub use series::TimeSeries;
