//! Dataset composition and download-option resolution for a single-cell
//! genomics data portal.
//!
//! A user's cross-project sample selection lives in a [`dataset::Dataset`];
//! [`selection::SelectionModel`] drives one project's sample table,
//! [`store::DatasetStore`] applies aggregate edits and merges,
//! [`resolver::OptionsResolver`] narrows download choices against a
//! [`catalog::CatalogIndex`], and [`lifecycle`] follows the server-side
//! packaging job.

pub mod api;
pub mod app;
pub mod catalog;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod local_state;
pub mod output;
pub mod resolver;
pub mod selection;
pub mod store;
