pub mod agent;
pub mod errors;
pub mod models;
pub mod providers;
pub mod sse;
pub mod tools;
