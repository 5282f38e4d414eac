pub mod config;
pub mod error;
pub mod model;
pub mod progress;
pub mod services;
pub mod store;

#[cfg(test)]
pub mod test_support;
