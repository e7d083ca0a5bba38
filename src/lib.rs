//! Remote change synchronization.
//!
//! Keeps a local system in sync with a remote resource server that announces
//! changes through subscription webhooks. A notification is coalesced per
//! subscription resource and queued; processing it polls the remote server
//! for everything updated since the stored watermark, drops versions already
//! processed, and queues each new change for downstream consumption. The
//! [`local`] cache batches the resulting writes per unit of work.

pub mod config;
pub mod local;
pub mod persistence;
pub mod poll;
pub mod queue;
pub mod retry;
pub mod server;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod test_utils;
