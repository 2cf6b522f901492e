//! Boxes: typed access to the objects of one entity type.
//!
//! [`EntityBox`] works synchronously inside the calling thread's
//! transaction; [`AsyncBox`] queues writes for a background worker.

mod async_box;
mod codec;
mod typed;

pub use async_box::AsyncBox;
pub use codec::{EntityCodec, BINDING_VERSION};
pub use typed::EntityBox;

pub(crate) use async_box::AsyncQueue;
pub(crate) use codec::{decode_record, encode_record};
