pub mod client;
pub mod logging;
pub mod protocol;
pub mod reconcile;
pub mod relay;
pub mod roster;
pub mod storage;
