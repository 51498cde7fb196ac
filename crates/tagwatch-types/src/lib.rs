//! Platform-agnostic types for BLE tracker tags.
//!
//! This crate holds everything that does not need a radio: identifiers,
//! firmware versions, the command frame encoder, the GATT routing table,
//! advertisement markers and the connection state machine. The async
//! coordination layer lives in `tagwatch-core`.
//!
//! # Example
//!
//! ```
//! use tagwatch_types::{Command, ConnectionState, StateInput};
//!
//! let frame = Command::BuzzAndBlink.encode().unwrap();
//! assert_eq!(frame, vec![0xA1, 0x03]);
//!
//! let t = ConnectionState::Disconnected.apply(StateInput::ConnectRequested).unwrap();
//! assert_eq!(t.next, ConnectionState::Connecting);
//! ```

pub mod advertisement;
pub mod command;
pub mod error;
pub mod state;
pub mod types;
pub mod uuid;

pub use advertisement::{AdvertisementFlags, DeviceNotification};
pub use command::{Command, MAX_FRAME_LEN, Opcode};
pub use error::{ParseError, ParseResult};
pub use state::{ConnectionState, Effect, InvalidTransition, StateInput, Transition};
pub use types::{AlertMode, FirmwareVersion, LOGICAL_ID_LEN, LogicalId, PeripheralHandle};
pub use self::uuid as uuids;
pub use self::uuid::GattCharacteristic;
