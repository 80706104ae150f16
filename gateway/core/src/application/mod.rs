// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod health;
pub mod lock_manager;
pub mod registry;
pub mod router;
pub mod transfer_manager;
