use log::trace;

use super::emulator::{CommandHistory, Consumed, Flow, ProtocolEmulator};
use super::line_buffer::LineBuffer;
use crate::configuration::types::ProtocolTag;
use crate::error_handling::types::SessionFault;
use crate::event::Summary;

pub const DEFAULT_SHELL_GREETING: &str = "login: ";

const HOSTNAME: &str = "srv01";

const IAC: u8 = 255;
const SB: u8 = 250;
const SE: u8 = 240;
const WILL: u8 = 251;
const DONT: u8 = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelnetState {
    Data,
    Iac,
    Option,
    Sub,
    SubIac,
}

/// Removes telnet negotiation sequences from the byte stream. State carries
/// over between chunks since a sequence may be split by the network.
#[derive(Debug)]
struct TelnetFilter {
    state: TelnetState,
}

impl TelnetFilter {
    fn new() -> Self {
        Self {
            state: TelnetState::Data,
        }
    }

    fn filter(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(bytes.len());
        for &b in bytes {
            self.state = match (self.state, b) {
                (TelnetState::Data, IAC) => TelnetState::Iac,
                (TelnetState::Data, 0) => TelnetState::Data, // CR NUL
                (TelnetState::Data, _) => {
                    data.push(b);
                    TelnetState::Data
                }
                (TelnetState::Iac, IAC) => {
                    data.push(IAC);
                    TelnetState::Data
                }
                (TelnetState::Iac, SB) => TelnetState::Sub,
                (TelnetState::Iac, WILL..=DONT) => TelnetState::Option,
                (TelnetState::Iac, _) => TelnetState::Data,
                (TelnetState::Option, _) => TelnetState::Data,
                (TelnetState::Sub, IAC) => TelnetState::SubIac,
                (TelnetState::Sub, _) => TelnetState::Sub,
                (TelnetState::SubIac, SE) => TelnetState::Data,
                (TelnetState::SubIac, _) => TelnetState::Sub,
            };
        }
        data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Login,
    Password,
    Shell,
}

/// Telnet-style login followed by a fake shell prompt.
pub struct ShellEmulator {
    greeting: String,
    telnet: TelnetFilter,
    lines: LineBuffer,
    stage: Stage,
    username: Option<String>,
    password: Option<String>,
    history: CommandHistory,
}

impl ShellEmulator {
    pub fn new(banner: Option<String>) -> Self {
        Self {
            greeting: banner.unwrap_or_else(|| DEFAULT_SHELL_GREETING.to_string()),
            telnet: TelnetFilter::new(),
            lines: LineBuffer::default(),
            stage: Stage::Login,
            username: None,
            password: None,
            history: CommandHistory::default(),
        }
    }

    fn user(&self) -> &str {
        self.username.as_deref().unwrap_or("root")
    }

    fn prompt(&self) -> String {
        let user = self.user();
        let sigil = if user == "root" { '#' } else { '$' };
        format!("{}@{}:~{} ", user, HOSTNAME, sigil)
    }

    fn home(&self) -> String {
        match self.user() {
            "root" => "/root".to_string(),
            user => format!("/home/{}", user),
        }
    }

    fn run_command(&self, command: &str) -> String {
        let program = command.split_whitespace().next().unwrap_or_default();
        match command {
            "uname -a" => format!(
                "Linux {} 5.15.0-91-generic #101-Ubuntu SMP x86_64 GNU/Linux\r\n",
                HOSTNAME
            ),
            "uname" => "Linux\r\n".to_string(),
            "whoami" => format!("{}\r\n", self.user()),
            "id" if self.user() == "root" => "uid=0(root) gid=0(root) groups=0(root)\r\n".to_string(),
            "id" => format!(
                "uid=1000({0}) gid=1000({0}) groups=1000({0})\r\n",
                self.user()
            ),
            "pwd" => format!("{}\r\n", self.home()),
            _ if matches!(program, "cd" | "ls" | "echo" | "export") => {
                // harmless builtins answer with silence
                String::new()
            }
            _ => format!("sh: {}: command not found\r\n", program),
        }
    }

    fn handle_line(&mut self, line: &str, out: &mut Consumed) {
        match self.stage {
            Stage::Login => {
                let user = line.trim();
                if user.is_empty() {
                    out.respond(DEFAULT_SHELL_GREETING);
                    return;
                }
                self.username = Some(user.to_string());
                self.stage = Stage::Password;
                out.respond("Password: ");
            }
            Stage::Password => {
                self.password = Some(line.to_string());
                self.stage = Stage::Shell;
                let summary = Summary::new()
                    .with("event", "login_attempt")
                    .with("username", self.user())
                    .with("password", line);
                out.record(summary, line);
                out.respond("\r\nWelcome to Ubuntu 22.04.3 LTS (GNU/Linux 5.15.0-91-generic x86_64)\r\n\r\n");
                out.respond(self.prompt());
            }
            Stage::Shell => {
                let command = line.trim();
                if command.is_empty() {
                    out.respond(self.prompt());
                    return;
                }
                trace!("Shell command {:?}", command);
                self.history.push(command);
                let summary = Summary::new()
                    .with("event", "command")
                    .with("username", self.user())
                    .with("command", command);
                out.record(summary, line);
                if command == "exit" || command == "logout" {
                    out.respond("logout\r\n");
                    out.terminate();
                    return;
                }
                let output = self.run_command(command);
                out.respond(output);
                out.respond(self.prompt());
            }
        }
    }
}

impl ProtocolEmulator for ShellEmulator {
    fn protocol(&self) -> ProtocolTag {
        ProtocolTag::Shell
    }

    fn greeting(&self) -> Vec<u8> {
        self.greeting.as_bytes().to_vec()
    }

    fn consume(&mut self, bytes: &[u8]) -> Result<Consumed, SessionFault> {
        let data = self.telnet.filter(bytes);
        let mut out = Consumed::default();
        for line in self.lines.push(&data)? {
            self.handle_line(&line, &mut out);
            if out.flow == Flow::Terminate {
                break;
            }
        }
        Ok(out)
    }

    fn summary(&self) -> Summary {
        let mut summary = Summary::new();
        if let Some(username) = &self.username {
            summary.insert("username", username);
        }
        if let Some(password) = &self.password {
            summary.insert("password", password);
        }
        self.history.summarize_into(&mut summary);
        summary
    }
}
