pub mod connection_manager;
pub mod dispatch_queue;
pub mod message_dispatcher;
pub mod routing_engine;
pub mod session_directory;
pub mod subscriber_index;
pub mod subscription_manager;

pub use connection_manager::{ConnectionHandle, ConnectionManager, OnlineStatus, UserDelivery};
pub use dispatch_queue::{DispatchQueue, QueueOutcome};
pub use message_dispatcher::MessageDispatcher;
pub use routing_engine::{RoutingEngine, RoutingRule};
pub use session_directory::SessionDirectory;
pub use subscriber_index::SubscriberIndex;
pub use subscription_manager::{SubscriptionManager, auto_subscription_topics};
