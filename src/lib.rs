//! Gallery photo analysis core.
//!
//! Turns a gallery of uploaded photographs into searchable structured
//! metadata: natural-language descriptions, detected people with bounding
//! boxes and role/expression annotations, search tags, and cross-photo
//! person clusters. Built as a library; a job runner invokes
//! [`pipeline::analyze_gallery`] and, read-only,
//! [`pipeline::search_gallery_photos`].
//!
//! External collaborators (image store, CV face detector, vision-language
//! annotator, face embedding index, record store) are injected as traits;
//! `services` and `store` provide the production implementations.

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod services;
pub mod store;

pub use config::AnalysisConfig;
pub use error::AnalysisError;
pub use pipeline::{analyze_gallery, analyze_photo, cluster_persons, search_gallery_photos, AnalysisContext};
