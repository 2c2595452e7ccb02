// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational query executor.
//!
//! Everything the engine learns about current relational state goes through
//! [`RowSource`]: main-table re-queries, join lookups, object-field
//! sub-queries and bulk loads.

mod memory;
mod sql;
mod traits;

pub use memory::{QueryCall, ScriptedSource};
pub use sql::SqlSource;
pub use traits::{RowSource, SourceError};
