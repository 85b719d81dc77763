mod channel;
mod config;
mod correlate;
mod error;
mod stream;
mod wire;

pub use channel::{Channel, ChannelRegistry};
pub use config::{
    Config, SelectionPolicy, DEFAULT_REQUEST_QUEUE_SIZE, DEFAULT_REQUEST_TIMEOUT,
};
pub use error::{Error, Unanswered};
pub use stream::{EventStream, EventSubscription};
pub use wire::{
    ChannelId, ConnectedCompleted, EventId, Method, ParseEventIdError,
    RequestEvent, ResourceRequest, ResponseEvent,
};

// Storage providers cannot be dialed. Instead each one keeps a long-lived
// listen call open against us, and we push "do you have X" / "give me X"
// requests down that call as events. The provider answers out of band with a
// separate respond call, and the answer is matched back to the waiting request
// by its ID.
//
// Each listen call owns exactly one channel. A keeper task holds the channel in
// the registry until the listen context ends or the provider drops its end, and
// is the only place a channel is ever removed. Requests never wait on a full
// queue: they fail, since a lost request is indistinguishable from a dead peer.
//
// Correlation state lives in a single pending table keyed by request ID. A
// record is created before the request is pushed and removed on every exit
// path, so a response that arrives after its caller gave up, or a second
// response to a broadcast request, simply finds nothing and is dropped.
