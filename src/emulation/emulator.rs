use crate::configuration::types::ProtocolTag;
use crate::error_handling::types::SessionFault;
use crate::event::Summary;

/// Whether the session should keep reading after a `consume` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Flow {
    #[default]
    Continue,
    Terminate,
}

/// One noteworthy interaction, with the input line that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub summary: Summary,
    pub excerpt: Vec<u8>,
}

/// Result of feeding bytes to an emulator.
#[derive(Debug, Default, PartialEq)]
pub struct Consumed {
    /// Bytes to send back to the peer.
    pub response: Vec<u8>,
    /// Noteworthy interactions observed in these bytes, in input order. Each
    /// becomes an intermediate event record.
    pub records: Vec<Observation>,
    pub flow: Flow,
}

impl Consumed {
    pub fn record(&mut self, summary: Summary, line: &str) {
        self.records.push(Observation {
            summary,
            excerpt: line.as_bytes().to_vec(),
        });
    }

    pub fn respond(&mut self, bytes: impl AsRef<[u8]>) {
        self.response.extend_from_slice(bytes.as_ref());
    }

    pub fn terminate(&mut self) {
        self.flow = Flow::Terminate;
    }
}

/// Commands kept verbatim for the terminal summary; later ones are only counted.
pub const MAX_RECORDED_COMMANDS: usize = 32;

/// Bounded record of the commands a peer issued.
#[derive(Debug, Default)]
pub struct CommandHistory {
    commands: Vec<String>,
    total: u64,
}

impl CommandHistory {
    pub fn push(&mut self, command: &str) {
        self.total += 1;
        if self.commands.len() < MAX_RECORDED_COMMANDS {
            self.commands.push(command.to_string());
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Adds `commands` and `command_count` fields when anything was issued.
    pub fn summarize_into(&self, summary: &mut Summary) {
        if self.total == 0 {
            return;
        }
        summary.insert("commands", self.commands.join("; "));
        summary.insert("command_count", self.total.to_string());
    }
}

/// Per-protocol logic bound to one connection.
///
/// An emulator only interprets bytes. Reading, writing, deadlines, byte quotas,
/// record ids and timestamps are owned by the connection session driving it,
/// so every protocol shares the same resource limits.
pub trait ProtocolEmulator: Send {
    fn protocol(&self) -> ProtocolTag;

    /// Bytes sent as soon as the connection is accepted.
    fn greeting(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Interprets the next chunk of attacker bytes.
    ///
    /// An `Err` ends the session with a fault record; it must never be used
    /// for conditions that concern anything but this one connection.
    fn consume(&mut self, bytes: &[u8]) -> Result<Consumed, SessionFault>;

    /// Summary of the whole interaction so far, used for the terminal record.
    /// Empty when nothing was received.
    fn summary(&self) -> Summary;
}
