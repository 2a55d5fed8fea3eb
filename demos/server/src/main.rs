//! Example Modbus slave serving one process image over TCP and, optionally, a serial port
//!
//! Commands read from stdin:
//!
//! * `x` - shut down and exit
//! * `ed` / `dd` - enable / disable protocol decoding
//! * `uc` / `udi` - toggle the first 10 coils / discrete inputs
//! * `uhr` / `uir` - increment the first 10 holding / input registers
//! * `show` - print the first 10 cells of each bank

use std::net::SocketAddr;

use clap::Parser;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};

use mbserver::*;

const SHOWN_CELLS: usize = 10;

#[derive(Debug, Parser)]
#[command(about = "Modbus slave serving one process image to every connection")]
struct Args {
    /// unit id this server answers to
    #[arg(long, default_value_t = 1)]
    unit_id: u8,
    /// TCP address to listen on, can be repeated (defaults to 127.0.0.1:502)
    #[arg(long)]
    tcp: Vec<SocketAddr>,
    /// maximum number of concurrent sessions per TCP listener
    #[arg(long)]
    max_sessions: Option<usize>,
    /// serial port to serve RTU requests on
    #[cfg(feature = "serial")]
    #[arg(long)]
    serial: Option<String>,
    /// baud rate of the serial port
    #[cfg(feature = "serial")]
    #[arg(long, default_value_t = 9600)]
    baud: u32,
}

/// custom function code that returns the data of the request unchanged
const ECHO_FUNCTION: u8 = 0x41;

fn echo(_: &mut Memory, frame: &dyn Frame) -> Result<Vec<u8>, ExceptionCode> {
    tracing::info!("echo {} bytes", frame.payload().len());
    Ok(frame.payload().to_vec())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let args = Args::parse();

    let server = Server::spawn(ServerSettings {
        unit_id: UnitId::new(args.unit_id),
        max_sessions: args.max_sessions,
        ..Default::default()
    });

    let mut tcp = args.tcp;
    if tcp.is_empty() {
        tcp.push("127.0.0.1:502".parse()?);
    }
    for addr in tcp {
        server.listen_tcp(addr).await?;
    }

    #[cfg(feature = "serial")]
    if let Some(path) = args.serial {
        let settings = SerialSettings {
            baud_rate: args.baud,
            ..Default::default()
        };
        server.listen_rtu(&path, settings).await?;
    }

    server.register(ECHO_FUNCTION, echo)?;

    let mut reader = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    while let Some(line) = reader.next().await {
        match line?.as_str() {
            "x" => break,
            "ed" => server.set_decode_level(DecodeLevel::everything()),
            "dd" => server.set_decode_level(DecodeLevel::nothing()),
            "uc" => {
                server
                    .memory(|mem| {
                        for coil in mem.coils.iter_mut().take(SHOWN_CELLS) {
                            *coil = !*coil;
                        }
                    })
                    .await?
            }
            "udi" => {
                server
                    .memory(|mem| {
                        for input in mem.discrete_inputs.iter_mut().take(SHOWN_CELLS) {
                            *input = !*input;
                        }
                    })
                    .await?
            }
            "uhr" => {
                server
                    .memory(|mem| {
                        for register in mem.holding_registers.iter_mut().take(SHOWN_CELLS) {
                            *register = register.wrapping_add(1);
                        }
                    })
                    .await?
            }
            "uir" => {
                server
                    .memory(|mem| {
                        for register in mem.input_registers.iter_mut().take(SHOWN_CELLS) {
                            *register = register.wrapping_add(1);
                        }
                    })
                    .await?
            }
            "show" => {
                let memory = server
                    .memory(|mem| {
                        let mut shown = Memory::new(BankCapacity::uniform(0));
                        shown.coils = mem.coils.iter().take(SHOWN_CELLS).copied().collect();
                        shown.discrete_inputs = mem
                            .discrete_inputs
                            .iter()
                            .take(SHOWN_CELLS)
                            .copied()
                            .collect();
                        shown.holding_registers = mem
                            .holding_registers
                            .iter()
                            .take(SHOWN_CELLS)
                            .copied()
                            .collect();
                        shown.input_registers = mem
                            .input_registers
                            .iter()
                            .take(SHOWN_CELLS)
                            .copied()
                            .collect();
                        shown
                    })
                    .await?;
                println!("coils: {:?}", memory.coils);
                println!("discrete inputs: {:?}", memory.discrete_inputs);
                println!("holding registers: {:?}", memory.holding_registers);
                println!("input registers: {:?}", memory.input_registers);
            }
            _ => println!("unknown command"),
        }
    }

    server.close().await;
    Ok(())
}
