// SfcSim: Discrete-Event Simulator for SFC Traffic Scheduling written in Rust
// Copyright (C) 2022-2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! The SFC data model: flows and packet classes, packets, servers with CPU
//! share policies, service function instances, and service function
//! forwarders.
//!
//! All entities live in arenas owned by the [`crate::simulator::Simulator`]
//! and reference each other through integer ids; the operational logic is
//! implemented as `Simulator` methods in the respective module.

mod flow;
mod packet;
mod server;
mod sff;
mod sfi;

pub use flow::{ClassRegistry, Flow};
pub use packet::{Packet, PacketTimers};
pub use server::Server;
pub use sff::{PacketSource, Sff, SffQueues};
pub use sfi::Sfi;

pub(crate) use packet::DropAction;
