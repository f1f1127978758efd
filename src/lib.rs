pub mod conversation;
pub mod directory;
pub mod election;
pub mod handheld;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod scheduler;
pub mod simulation;
pub mod transport;
