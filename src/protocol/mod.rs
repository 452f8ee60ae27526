//! Wire protocol: the envelope exchanged over the transport and its codec.
//!
//! Every message is a JSON object with five fields:
//!
//! ```text
//! { "ts": <epoch-ms>, "data": <any>, "from_topic": <string>,
//!   "request_id": <string|null>, "callback_id": <string|null> }
//! ```
//!
//! `request_id` is set only on requests, `callback_id` only on replies. A
//! responder answers a request by echoing its `request_id` back as
//! `callback_id`, published to the requester's `from_topic`.
mod codec;
mod envelope;

pub use codec::{decode, encode};
pub use envelope::{Correlation, Envelope};
