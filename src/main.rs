//! Diagnostic command-line tool for IIOD daemons.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use iiod_client::Manager;

#[derive(Parser, Debug)]
#[clap(version, about = "Diagnostics for IIOD daemons", long_about = None)]
struct Args {
    #[clap(
        short,
        long,
        default_value_t = 2500,
        help = "connect and I/O timeout in milliseconds"
    )]
    timeout: u64,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show the daemon's context, devices, and channels.
    Info {
        #[clap(help = "host or host:port")]
        host: String,
    },
    /// Fetch the context XML verbatim.
    Xml {
        host: String,
        #[clap(short, long, help = "write to a file instead of stdout")]
        output: Option<PathBuf>,
    },
    /// Read an attribute (with the legacy-server fallback).
    Read {
        host: String,
        device: String,
        attr: String,
        #[clap(long, help = "channel id; omit for a device-level attribute")]
        channel: Option<String>,
        #[clap(long, help = "read a buffer attribute")]
        buffer: bool,
    },
    /// Write an attribute (with the legacy-server fallback).
    Write {
        host: String,
        device: String,
        attr: String,
        value: String,
        #[clap(long)]
        channel: Option<String>,
        #[clap(long, help = "write a buffer attribute")]
        buffer: bool,
    },
    /// Capture samples over the binary dialect and print them decoded.
    Capture {
        host: String,
        device: String,
        #[clap(short = 'n', long, default_value_t = 1024)]
        samples: usize,
        #[clap(
            short,
            long = "channel",
            help = "channel ids to enable; default is every scannable channel"
        )]
        channels: Vec<String>,
    },
}

fn open(host: &str, timeout_ms: u64) -> Result<Manager> {
    let mgr = Manager::new(host);
    mgr.connect(Duration::from_millis(timeout_ms))?;
    Ok(mgr)
}

fn info(host: &str, timeout_ms: u64) -> Result<()> {
    let mgr = open(host, timeout_ms)?;
    mgr.set_server_timeout(timeout_ms as u32)?;
    mgr.fetch_xml()?;
    let ctx = mgr.context()?;
    println!(
        "{} v{}.{} {} ({})",
        ctx.name, ctx.version_major, ctx.version_minor, ctx.version_git, ctx.description
    );
    for (name, value) in &ctx.attrs {
        println!("  {name} = {value}");
    }
    println!("{} device(s), {} channel(s)", ctx.no_devices(), ctx.no_channels());
    for dev in &ctx.devices {
        match &dev.label {
            Some(label) => println!("{}: {} [{label}]", dev.id, dev.name),
            None => println!("{}: {}", dev.id, dev.name),
        }
        for chan in &dev.channels {
            let dir = match chan.direction {
                iiod_client::context::Direction::Input => "input",
                iiod_client::context::Direction::Output => "output",
            };
            match &chan.scan_element {
                Some(se) => println!("  {} ({dir}, scan {} {})", chan.id, se.index, se.format),
                None => println!("  {} ({dir})", chan.id),
            }
        }
    }
    mgr.close()
}

fn xml(host: &str, timeout_ms: u64, output: Option<PathBuf>) -> Result<()> {
    let mgr = open(host, timeout_ms)?;
    mgr.set_server_timeout(timeout_ms as u32)?;
    let bytes = mgr.fetch_xml()?;
    match output {
        Some(path) => fs::write(&path, &bytes).wrap_err_with(|| format!("writing {path:?}"))?,
        None => io::stdout().write_all(&bytes)?,
    }
    mgr.close()
}

fn capture(
    host: &str,
    timeout_ms: u64,
    device: &str,
    samples: usize,
    channels: Vec<String>,
) -> Result<()> {
    if samples == 0 {
        bail!("nothing to capture");
    }
    let mgr = open(host, timeout_ms)?;
    if !mgr.bootstrap(timeout_ms as u32, true)? {
        bail!("server declined the binary dialect; capture needs it");
    }
    let ctx = mgr.context()?;
    let dev = ctx.device(device)?;
    let index = ctx.device_index(device)?;

    let wanted: Vec<String> = if channels.is_empty() {
        dev.channels
            .iter()
            .filter(|c| c.scan_element.is_some())
            .map(|c| c.id.clone())
            .collect()
    } else {
        channels
    };
    let mut mask = Vec::with_capacity(wanted.len());
    for id in &wanted {
        let chan = dev.channel(id)?;
        let se = match &chan.scan_element {
            Some(se) => se,
            None => bail!("channel {id} has no scan element"),
        };
        mask.push(se.index as u8);
        mgr.mark_channel_enabled(device, id, true);
    }
    let map = mgr.build_decode_map(device)?;

    let buffer = mgr.create_buffer(index, &mask, false)?;
    mgr.enable_buffer(buffer)?;
    let block = mgr.create_block(buffer, samples * map.sample_size)?;
    let mut frame = vec![0u8; samples * map.sample_size];
    let n = mgr.transfer_block(block, &mut frame)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let labels: Vec<&str> = map.entries.iter().map(|e| e.label.as_str()).collect();
    writeln!(out, "{}", labels.join("\t"))?;
    for sample in map.decode(&frame[..n.min(frame.len())])? {
        let row: Vec<String> = map
            .entries
            .iter()
            .map(|e| {
                sample[&e.label]
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect();
        writeln!(out, "{}", row.join("\t"))?;
    }

    mgr.free_block(block)?;
    mgr.disable_buffer(buffer)?;
    mgr.free_buffer(buffer)?;
    mgr.close()
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    match args.cmd {
        Cmd::Info { host } => info(&host, args.timeout),
        Cmd::Xml { host, output } => xml(&host, args.timeout, output),
        Cmd::Read {
            host,
            device,
            attr,
            channel,
            buffer,
        } => {
            let mgr = open(&host, args.timeout)?;
            mgr.bootstrap(args.timeout as u32, true)?;
            let value = if buffer {
                mgr.read_buffer_attr(&device, &attr)?
            } else {
                mgr.read_attr_compat(&device, channel.as_deref().unwrap_or(""), &attr)?
            };
            println!("{value}");
            mgr.close()
        }
        Cmd::Write {
            host,
            device,
            attr,
            value,
            channel,
            buffer,
        } => {
            let mgr = open(&host, args.timeout)?;
            mgr.bootstrap(args.timeout as u32, true)?;
            if buffer {
                mgr.write_buffer_attr(&device, &attr, &value)?;
            } else {
                mgr.write_attr_compat(&device, channel.as_deref().unwrap_or(""), &attr, &value)?;
            }
            mgr.close()
        }
        Cmd::Capture {
            host,
            device,
            samples,
            channels,
        } => capture(&host, args.timeout, &device, samples, channels),
    }
}
