//! Per-entity serial execution ([`Strand`]) layered over a shared fixed-size [`ThreadPool`].
pub mod strand;
pub mod threadpool;

pub use strand::Strand;
pub use threadpool::ThreadPool;
