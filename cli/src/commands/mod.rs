// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! CLI command implementations

pub mod daemon;
pub mod device;
pub mod health;
pub mod lock;
pub mod task;
pub mod transfer;

pub use device::DeviceCommand;
pub use health::HealthCommand;
pub use lock::LockCommand;
pub use task::TaskCommand;
pub use transfer::TransferCommand;
