//! Crossover core: routing model, router and the asynchronous action protocol
//!
//! Everything in this crate is single-threaded domain logic. Threads, file
//! descriptors and the event loop live in `crossover-infra`.

pub mod domain;
