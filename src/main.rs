//! wchflash - Debug-probe flash programmer for WCH CH32F2x microcontrollers
//!
//! Drives the on-chip flash controller through a debug probe: sector and
//! block erases, streamed programming via a resident RAM routine, option
//! bytes and write protection. The engine lives in `wchflash-core`; this
//! binary parses arguments, opens a probe backend and maps engine errors
//! to exit codes.

mod cli;
mod commands;
mod probes;

use clap::Parser;
use cli::{Cli, Commands, OptionsCommands};
use wchflash_core::bank::{BankConfig, FlashBank};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.verbose {
        0 => {}
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let mut target = match probes::open(&cli.probe) {
        Ok(target) => target,
        Err(e) => {
            eprintln!("Failed to open probe: {}", e);
            std::process::exit(1);
        }
    };

    let mut bank = FlashBank::new(BankConfig {
        size: cli.flash_size.unwrap_or(0),
        ..BankConfig::default()
    });

    let result = match cli.command {
        Commands::Probe => commands::probe::run(&mut target, &mut bank),
        Commands::Erase { first, last } => {
            commands::erase::run(&mut target, &mut bank, first, last)
        }
        Commands::MassErase => commands::erase::run_mass(&mut target, &mut bank),
        Commands::Write {
            input,
            offset,
            no_erase,
        } => commands::write::run(&mut target, &mut bank, &input, offset, no_erase),
        Commands::Protect { first, last } => {
            commands::protect::run(&mut target, &mut bank, true, first, last)
        }
        Commands::Unprotect { first, last } => {
            commands::protect::run(&mut target, &mut bank, false, first, last)
        }
        Commands::Options { command } => match command {
            OptionsCommands::Read => commands::options::run_read(&mut target, &mut bank),
            OptionsCommands::Write {
                watchdog,
                reset_on_stop,
                reset_on_standby,
                ram_code_mode,
                user_data,
            } => commands::options::run_write(
                &mut target,
                &mut bank,
                watchdog,
                reset_on_stop,
                reset_on_standby,
                ram_code_mode,
                user_data,
            ),
        },
        Commands::Lock => commands::options::run_lock(&mut target, &mut bank),
        Commands::Unlock => commands::options::run_unlock(&mut target, &mut bank),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
