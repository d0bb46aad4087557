use std::process::ExitCode;

use clap::error::ErrorKind as ClapErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ringcast_relay::relay::{ignore_sigpipe, stdin_ingest};
use ringcast_relay::Relay;

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Live FLV ring-buffer fan-out relay", long_about = None)]
struct Args {
    /// Number of ring buffer slots
    buffer_count: usize,

    /// Stream name; the listener binds /tmp/shared_socket_<streamName>
    stream_name: String,

    /// Push source IP. When given, stdin is ignored and ingest waits for a
    /// peer registering with a matching `P` control line
    push_ip: Option<String>,
}

fn main() -> ExitCode {
    // diagnostics on stderr; stdout carries the operator-visible lines
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err)
            if matches!(
                err.kind(),
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    ignore_sigpipe();

    let mut relay = match Relay::new(args.buffer_count, &args.stream_name, args.push_ip.clone()) {
        Ok(relay) => relay,
        Err(err) => {
            tracing::error!("could not start relay: {err}");
            return ExitCode::from(1);
        }
    };
    if args.push_ip.is_none() {
        match stdin_ingest() {
            Ok(source) => relay.set_ingest(source),
            Err(err) => {
                tracing::error!("could not set up stdin ingest: {err}");
                return ExitCode::from(1);
            }
        }
    }

    if relay.run() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
