// SPDX-License-Identifier: GPL-3.0-only

//! Collaborator layer below the logical camera core
//!
//! The core never touches hardware. It talks to two collaborators:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Logical camera core               │
//! └────────────────────┬────────────────────────┘
//!                      │
//! ┌────────────────────┴────────────────────────┐
//! │              Backend Layer                   │
//! │  ┌─────────────┐    ┌──────────────────┐   │
//! │  │  Metadata   │    │    Pipelines     │   │
//! │  │   (pool)    │    │ (virtual/device) │   │
//! │  └─────────────┘    └──────────────────┘   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! - [`metadata`]: reference-counted per-frame metadata entries
//! - [`pipeline`]: physical pipeline contract, completion channels and a
//!   software pipeline used by the CLI and tests

pub mod metadata;
pub mod pipeline;
