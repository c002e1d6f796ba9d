//! Blocking synchronization primitives shared by the worker pool.

pub mod semaphore;

pub use semaphore::Semaphore;
