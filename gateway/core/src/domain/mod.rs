// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod config;
pub mod device;
pub mod events;
pub mod lock;
pub mod message;
pub mod provider;
pub mod task;
pub mod transfer;
