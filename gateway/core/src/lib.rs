// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AEGIS Fleet Gateway core
//!
//! Orchestration and communication substrate for a heterogeneous device
//! fleet: wire protocol codec, device registry, capability routing, DAG
//! task scheduling, resumable transfers, distributed locks and the
//! health monitor.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain + application services for the fleet gateway

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
