pub mod dispatch;
pub mod frame;
pub mod message;
pub mod routing;
pub mod session;
pub mod subscription;

pub use dispatch::{DispatchAccumulator, DispatchAction, DispatchResult, DispatchType, TargetOutcome};
pub use frame::ServerFrame;
pub use message::{MessageType, RealtimeMessage};
pub use routing::RoutingDecision;
pub use session::{ClientIdentity, ClientInfo, Session, SessionStatus};
pub use subscription::{
    DenialReason, Subscription, SubscriptionLevel, SubscriptionOutcome, UnsubscribeOutcome,
};
