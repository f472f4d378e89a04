pub mod bootstrap;
pub mod sweeper;

pub use bootstrap::{RealtimeRuntime, RuntimeDependencies};
pub use sweeper::{SessionSweeper, SweepReport, SweeperHandle};
