pub mod data;
pub mod gutma;
pub mod reader;
pub mod telemetry;
