pub mod call;
pub mod config;
pub mod judge;
pub mod phase;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod semantic;
