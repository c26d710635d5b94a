//! CLI argument parsing

use crate::probes;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    parse_hex_u32(s).and_then(|v| u16::try_from(v).map_err(|_| "Value exceeds 16 bits".into()))
}

/// Generate dynamic help text for the probe argument
fn probe_help() -> String {
    format!("Debug probe to use [available: {}]", probes::probe_names_short())
}

#[derive(Parser)]
#[command(name = "wchflash")]
#[command(author, version, about = "CH32F2x debug-probe flash programmer", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Debug probe specification
    #[arg(short, long, global = true, default_value = "dummy", help = probe_help())]
    pub probe: String,

    /// Override the probed flash size in bytes (for devices with a broken
    /// size register)
    #[arg(long, global = true, value_parser = parse_hex_u32)]
    pub flash_size: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Watchdog selection for the user option byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Watchdog {
    /// Software controlled (IWDG off unless firmware starts it)
    Software,
    /// Hardware watchdog, always running
    Hardware,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Identify the device and print flash geometry
    Probe,

    /// Erase a sector range (the whole bank when no range is given)
    Erase {
        /// First sector to erase
        #[arg(long, default_value_t = 0)]
        first: u32,

        /// Last sector to erase (defaults to the end of the bank)
        #[arg(long)]
        last: Option<u32>,
    },

    /// Erase the whole bank in one mass-erase cycle
    MassErase,

    /// Program a file into flash
    Write {
        /// Input file path
        input: PathBuf,

        /// Byte offset into the flash bank (hex or decimal)
        #[arg(long, value_parser = parse_hex_u32, default_value = "0")]
        offset: u32,

        /// Skip erasing the affected sectors first
        #[arg(long)]
        no_erase: bool,
    },

    /// Write-protect a range of protection blocks
    Protect {
        /// First protection block
        #[arg(long)]
        first: u32,

        /// Last protection block
        #[arg(long)]
        last: u32,
    },

    /// Remove write protection from a range of protection blocks
    Unprotect {
        /// First protection block
        #[arg(long)]
        first: u32,

        /// Last protection block
        #[arg(long)]
        last: u32,
    },

    /// Inspect or change the option bytes
    Options {
        #[command(subcommand)]
        command: OptionsCommands,
    },

    /// Enable read protection (takes effect after reset)
    Lock,

    /// Disable read protection (mass-erases flash on real silicon)
    Unlock,
}

#[derive(Subcommand)]
pub enum OptionsCommands {
    /// Print the decoded option bytes
    Read,

    /// Rewrite the user option byte and user data
    ///
    /// Unspecified fields keep their current value.
    Write {
        /// Watchdog selection
        #[arg(long)]
        watchdog: Option<Watchdog>,

        /// Reset when entering stop mode
        #[arg(long)]
        reset_on_stop: Option<bool>,

        /// Reset when entering standby mode
        #[arg(long)]
        reset_on_standby: Option<bool>,

        /// RAM code mode field (0-3)
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=3))]
        ram_code_mode: Option<u8>,

        /// Raw 16-bit user data word (hex or decimal)
        #[arg(long, value_parser = parse_hex_u16)]
        user_data: Option<u16>,
    },
}
