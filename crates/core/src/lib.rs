pub mod config;
pub mod distributed;
pub mod layers;
pub mod models;
pub mod parallel;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
