pub mod docker;
pub mod migration;
pub mod snapshot;
pub mod transport;
