//! Wire protocol state machines, composed into pipelines as stages.

pub(crate) mod h1;
#[cfg(feature = "http2")]
pub(crate) mod h2;
pub(crate) mod ws;
