//! Thin connector: attach to a relay's shared socket and copy the raw FLV
//! stream to stdout.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "relay-raw")]
#[command(about = "Copy a relay's stream to stdout", long_about = None)]
struct Args {
    /// Stream name to attach to
    stream_name: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut socket = UnixStream::connect(format!("/tmp/shared_socket_{}", args.stream_name))?;
    let mut stdout = std::io::stdout().lock();
    let mut buffer = [0u8; 10_000];
    loop {
        let n = socket.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buffer[..n])?;
    }
    Ok(())
}
