//! Cross-crate scenarios: the peer protocol end to end, peer-driven
//! backfill into the product store, and the multicast pipeline.

mod backfill;
mod mcast_pipeline;
mod peer_transfer;
