// Copyright (C) 2024, 2025 Etherpool Developers (see AUTHORS)
//
// This file is part of Etherpool
//
// Etherpool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Etherpool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Etherpool. If not, see <https://www.gnu.org/licenses/>.

//! Ethash-family mining pool: work dispatch and share validation, per-IP
//! policy, block unlocking with per-network reward math, and on-chain
//! payouts, all backed by Redis and an upstream chain node.

pub mod config;
pub mod hasher;
pub mod logging;
pub mod payouts;
pub mod policy;
pub mod proxy;
pub mod rewards;
pub mod store;
pub mod supervisor;
pub mod unlocker;
pub mod util;
