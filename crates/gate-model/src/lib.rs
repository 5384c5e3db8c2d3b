// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Unified message/tool vocabulary, static model catalog, and the Model
//! Resolver that maps client-supplied model names onto the upstream's
//! canonical identifiers.

pub mod catalog;
pub mod resolver;
pub mod sanitize;
mod types;

pub use catalog::{max_input_tokens, ModelCatalogEntry};
pub use resolver::{
    extract_model_family, normalize_model_name, ModelCache, ModelResolver, Resolution,
    ResolutionSource, ResolverConfig,
};
pub use sanitize::strip_images_if_unsupported;
pub use types::*;
