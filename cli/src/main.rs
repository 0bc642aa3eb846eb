//! `srt-cli`: a thin send/recv-over-SRT demo binary exercising the public API
//! from the command line, in the same spirit as a perimeter binary sitting on
//! top of a teacher-style layered workspace.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use crypto::KeyLen;
use srt::{Config, Listener, Socket};
use utils::error::Result;

#[derive(Parser, Debug)]
#[command(author, version, about = "Send or receive a stream of data over SRT")]
struct Args {
	#[command(subcommand)]
	mode: Mode,

	/// Passphrase enabling AES encryption (10-79 bytes). Omit to run unencrypted.
	#[arg(long, global = true)]
	passphrase: Option<String>,

	/// Receiver buffering latency in milliseconds (§4.5's TSBPD delay).
	#[arg(long, global = true, default_value_t = 120)]
	latency_ms: u64,

	/// Log verbosity (error, warn, info, debug, trace).
	#[arg(long, global = true, default_value = "info")]
	log_level: String,
}

fn parse_level(level: &str) -> log::LevelFilter {
	level.parse().unwrap_or(log::LevelFilter::Info)
}

#[derive(Subcommand, Debug)]
enum Mode {
	/// Listen for one inbound connection and copy received messages to stdout.
	Listen {
		#[arg(long, default_value = "0.0.0.0:9000")]
		bind: SocketAddr,
	},
	/// Connect to a listener and copy stdin to it, one message per line.
	Send {
		#[arg(long, default_value = "0.0.0.0:0")]
		bind: SocketAddr,
		#[arg(long)]
		to: SocketAddr,
	},
}

fn build_config(args: &Args) -> Result<Config> {
	let mut config = Config::default().with_rcv_latency(Duration::from_millis(args.latency_ms));
	if let Some(passphrase) = &args.passphrase {
		config = config.with_passphrase(passphrase.clone(), KeyLen::Aes128);
	}
	config.validate()?;
	Ok(config)
}

fn run_listen(args: &Args, bind: SocketAddr) -> Result<()> {
	let config = build_config(args)?;
	let listener = Listener::bind(bind, config)?;
	log::info!("listening on {}", listener.local_addr()?);

	let sock = listener.accept(None)?;
	log::info!("accepted connection from peer socket id {}", sock.peer_socket_id());

	let stdout = io::stdout();
	let mut out = stdout.lock();
	loop {
		match sock.recv() {
			Ok(delivered) => {
				out.write_all(&delivered.data).ok();
				out.write_all(b"\n").ok();
			}
			Err(e) => {
				log::info!("connection ended: {e}");
				break;
			}
		}
	}

	Ok(())
}

fn run_send(args: &Args, bind: SocketAddr, to: SocketAddr) -> Result<()> {
	let config = build_config(args)?;
	let sock = Socket::connect(bind, to, config)?;
	log::info!("connected to {to}, local socket id {}", sock.local_socket_id());

	let mut input = String::new();
	io::stdin().read_to_string(&mut input).ok();

	for line in input.lines() {
		sock.send(line.as_bytes())?;
	}

	sock.close(Duration::from_secs(1));
	Ok(())
}

fn main() -> Result<()> {
	let args = Args::parse();
	runtime::install(parse_level(&args.log_level));

	match &args.mode {
		Mode::Listen { bind } => run_listen(&args, *bind),
		Mode::Send { bind, to } => run_send(&args, *bind, *to),
	}
}
