//! hycastd — the shipping (publisher) and receiving (subscriber) façades
//! that tie the product store, the multicast codec, and the peer overlay
//! together.

pub mod receiving;
pub mod shipping;

pub use receiving::{CompletionFn, Receiving};
pub use shipping::Shipping;
