// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure
//!
//! Code emission, loading and the lifetime-aware containers the caller cache
//! is built from.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Implements the caller template, trust boundary loader,
//!   synthesized caller and weak/soft reference containers

pub mod loader;
pub mod template;
pub mod trampoline;
pub mod weak_map;
