pub mod app;
pub mod classify;
pub mod config;
pub mod content;
pub mod documents;
pub mod domain;
pub mod error;
pub mod index;
pub mod metadata;
pub mod normalize;
pub mod output;
pub mod priority;
pub mod reconcile;
pub mod store;
