// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod audit_log;
pub mod codec;
pub mod event_bus;
pub mod snapshot;
pub mod transport;
