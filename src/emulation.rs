//! Protocol emulators.
//!
//! Each accepted connection gets a fresh emulator picked by the listener's
//! protocol tag. Emulators are pure byte interpreters: the connection session
//! owns all IO and limits.

pub mod emulator;
pub mod ftp;
pub mod http;
pub mod line_buffer;
pub mod shell;

pub use emulator::{Consumed, Flow, Observation, ProtocolEmulator};

use crate::configuration::types::ProtocolTag;

/// Builds the emulator for `protocol`. `banner` replaces the default greeting
/// (for HTTP, the `Server` header).
pub fn emulator_for(protocol: ProtocolTag, banner: Option<String>) -> Box<dyn ProtocolEmulator> {
    match protocol {
        ProtocolTag::Ftp => Box::new(ftp::FtpEmulator::new(banner)),
        ProtocolTag::Shell => Box::new(shell::ShellEmulator::new(banner)),
        ProtocolTag::Http => Box::new(http::HttpEmulator::new(banner)),
    }
}
