pub mod destination;

pub use destination::{Destination, DestinationKind, is_valid_segment};
