//! The io_uring operations a [`crate::Backend`] slot can hold.
//!
//! Each operation knows how to turn itself into a submission queue entry.
//! The opaque tag (`user_data`) is attached by the submission engine, not here.

pub mod poll_add;
pub(crate) mod poll_remove;
pub(crate) mod timer;

#[doc(inline)]
pub use poll_add::{Target, Watch};
