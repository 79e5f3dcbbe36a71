//! blockstore - buffered, encrypted batch commits over an append-only ledger
//!
//! Messages are buffered per stream, flushed by size or age, sealed by an
//! [`backend::Encryptor`] and pushed to a [`backend::Ledger`] as blocks. Each
//! block links to the previous block of its stream through a pointer kept in
//! an [`backend::IndexRegistry`], so the full history can be replayed.

pub mod backend;
pub mod block;
pub mod cli;
pub mod observability;
pub mod queue;
pub mod replay;
