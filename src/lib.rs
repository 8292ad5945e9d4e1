/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of ArcX Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Library surface for the wayback cache proxy, split out from the binary
//! so end-to-end behavior can be driven from `tests/` against a real TCP
//! listener and a mocked Wayback upstream.

pub mod admin;
pub mod cache;
pub mod config;
pub mod crawler;
pub mod domain;
pub mod error;
pub mod http;
pub mod server;
pub mod throttle;
pub mod transform;
pub mod wayback;

pub use server::Server;
