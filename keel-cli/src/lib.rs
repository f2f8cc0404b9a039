pub mod alerts;
pub mod app;
pub mod engine;
pub mod live;
pub mod state;
pub mod telemetry;

pub use app::run as run_app;
