/*
 * Imagesmith - Kubernetes controller for container image builds
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Imagesmith core library
//!
//! Custom resources for declaring image builds, the validators that gate
//! them, and the controllers that drive a `BuildRun` from submission to a
//! classified outcome.

pub mod admission;
pub mod backend;
pub mod crds;
pub mod failure;
pub mod git;
pub mod image_ref;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod tasks;
pub mod validate;

// Re-export commonly used types
pub use crds::{Build, BuildRun, BuildRunStatus, BuildSpec, BuildStatus};
pub use failure::{Failure, FailureReason};
pub use tasks::config::ControllerConfig;
pub use validate::{new_validation, BuildPath, ValidationType};
