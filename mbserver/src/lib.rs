//! An async Modbus slave built on [Tokio](https://docs.rs/tokio) that serializes every request,
//! from any number of TCP connections and serial ports, through a single dispatch task.
//!
//! # Features
//!
//! * One process image (discrete inputs, coils, holding and input registers) shared by
//!   every transport, mutated only by the dispatch task, so no locking is needed around it
//! * Requests are dispatched in arrival order; two requests never interleave
//! * Any function code can be added, overridden or removed at runtime
//! * Panic-free parsing of MBAP and RTU frames
//! * Orderly shutdown of listeners, sessions, serial ports and finally the dispatch task
//! * Protocol decoding through [tracing](https://docs.rs/tracing) at the application, frame
//!   and physical layer
//!
//! # Supported modes
//!
//! * TCP server (MBAP)
//! * RTU server over serial (feature `serial`, enabled by default) or any async stream
//!
//! # Supported functions
//!
//! * Read Coils
//! * Read Discrete Inputs
//! * Read Holding Registers
//! * Read Input Registers
//! * Write Single Coil
//! * Write Single Register
//! * Write Multiple Coils
//! * Write Multiple Registers
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use mbserver::{ExceptionCode, Frame, Memory, Server, ServerSettings, UnitId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::spawn(ServerSettings {
//!         unit_id: UnitId::new(1),
//!         ..Default::default()
//!     });
//!
//!     // seed the process image
//!     server.memory(|mem| mem.holding_registers[0] = 42).await?;
//!
//!     // a custom function code that returns the first holding register
//!     server.register(
//!         0x41,
//!         |mem: &mut Memory, _: &dyn Frame| -> Result<Vec<u8>, ExceptionCode> {
//!             Ok(mem.holding_registers[0].to_be_bytes().to_vec())
//!         },
//!     )?;
//!
//!     server.listen_tcp("0.0.0.0:502").await?;
//!
//!     tokio::time::sleep(Duration::from_secs(60)).await;
//!     server.close().await;
//!     Ok(())
//! }
//! ```

pub use crate::common::frame::Frame;
pub use crate::common::function::FunctionCode;
pub use crate::decode::*;
pub use crate::error::*;
pub use crate::exception::*;
pub use crate::serial::{DataBits, FlowControl, Parity, RtuFrame, SerialSettings, StopBits};
pub use crate::server::{BankCapacity, FunctionHandler, Memory, Server, ServerSettings};
pub use crate::tcp::TcpFrame;
pub use crate::types::*;

/// Modbus protocol constants
pub mod constants;

mod common;
mod decode;
mod error;
mod exception;
mod serial;
mod server;
mod tcp;
mod types;
