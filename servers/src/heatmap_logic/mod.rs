pub mod config;
pub mod state;
pub mod upstream;
pub mod downstream;
pub mod monitor;
