//! Wire protocol types.
//!
//! This module defines the packets exchanged with the chat service and
//! their binary encoding.
//!
//! # Protocol Overview
//!
//! | Packet | Direction | Purpose |
//! |--------|-----------|---------|
//! | Request | Client → Server | `READ`, `CREATE`, `UPDATE` or `DELETE` on a path |
//! | Response | Server → Client | `OK` or `ERROR`, correlated by id |
//! | Push | Server → Client | `UPDATE` or `DELETE` notification, id `0` |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `codec` | Binary encoding and strict decoding |
//! | `event` | Push event classification |
//! | `packet` | Packet and kind types |

// ============================================================================
// Submodules
// ============================================================================

/// Binary packet codec.
pub mod codec;

/// Push event classification.
pub mod event;

/// Packet and kind types.
pub mod packet;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::{decode, encode};
pub use event::{PushEvent, Resource, classify};
pub use packet::{Kind, Packet, Params, Value};
