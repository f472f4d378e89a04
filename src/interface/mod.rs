pub mod frame;
pub mod frame_handler;

pub use frame::ClientFrame;
pub use frame_handler::{ConnectionAccepted, FrameHandler};
