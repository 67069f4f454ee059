//! Curation engine for a personal markdown knowledge graph: bootstrap
//! ingestion, the per-turn observation loop, periodic reflection, and the
//! literal/semantic dedup engines, all built on a shared single-writer
//! graph store.

pub mod bootstrap;
pub mod dedup;
pub mod error;
pub mod llm;
pub mod model;
pub mod observer;
pub mod reflect;
pub mod session;
pub mod similarity;
pub mod store;
pub mod token;
