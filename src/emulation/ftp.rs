use log::trace;

use super::emulator::{CommandHistory, Consumed, Flow, ProtocolEmulator};
use super::line_buffer::LineBuffer;
use crate::configuration::types::ProtocolTag;
use crate::error_handling::types::SessionFault;
use crate::event::Summary;

pub const DEFAULT_FTP_GREETING: &str = "220 ProFTPD Server ready.\r\n";

/// FTP control channel that accepts any login and never opens a data
/// connection.
pub struct FtpEmulator {
    greeting: String,
    lines: LineBuffer,
    username: Option<String>,
    password: Option<String>,
    logged_in: bool,
    history: CommandHistory,
}

impl FtpEmulator {
    pub fn new(banner: Option<String>) -> Self {
        Self {
            greeting: banner.unwrap_or_else(|| DEFAULT_FTP_GREETING.to_string()),
            lines: LineBuffer::default(),
            username: None,
            password: None,
            logged_in: false,
            history: CommandHistory::default(),
        }
    }

    fn handle_line(&mut self, raw: &str, out: &mut Consumed) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
            None => (line.to_ascii_uppercase(), ""),
        };
        trace!("FTP command {} {:?}", verb, arg);

        // keep the secret out of the command trail; it lives in `password`
        if verb == "PASS" {
            self.history.push("PASS ****");
        } else {
            self.history.push(line);
        }

        match verb.as_str() {
            "USER" => {
                self.username = Some(arg.to_string());
                self.logged_in = false;
                out.respond(format!("331 Password required for {}\r\n", arg));
            }
            "PASS" => {
                let Some(username) = self.username.clone() else {
                    out.respond("503 Login with USER first\r\n");
                    return;
                };
                self.password = Some(arg.to_string());
                self.logged_in = true;
                out.record(
                    Summary::new()
                        .with("event", "login_attempt")
                        .with("username", &username)
                        .with("password", arg),
                    raw,
                );
                out.respond(format!("230 User {} logged in\r\n", username));
            }
            "QUIT" => {
                out.respond("221 Goodbye.\r\n");
                out.terminate();
            }
            "SYST" => out.respond("215 UNIX Type: L8\r\n"),
            "NOOP" => out.respond("200 NOOP command successful\r\n"),
            _ if !self.logged_in => out.respond("530 Please login with USER and PASS\r\n"),
            "PWD" => out.respond("257 \"/\" is the current directory\r\n"),
            "CWD" => out.respond("250 CWD command successful\r\n"),
            "TYPE" => out.respond(format!("200 Type set to {}\r\n", arg)),
            "PASV" => out.respond("227 Entering Passive Mode (127,0,0,1,195,149).\r\n"),
            "LIST" | "NLST" => {
                out.respond("425 Unable to build data connection: Connection refused\r\n")
            }
            "RETR" | "STOR" => {
                out.record(
                    Summary::new()
                        .with("event", "file_transfer")
                        .with("command", &verb)
                        .with("path", arg),
                    raw,
                );
                out.respond("425 Unable to build data connection: Connection refused\r\n");
            }
            _ => out.respond(format!("502 {} not implemented\r\n", verb)),
        }
    }
}

impl ProtocolEmulator for FtpEmulator {
    fn protocol(&self) -> ProtocolTag {
        ProtocolTag::Ftp
    }

    fn greeting(&self) -> Vec<u8> {
        self.greeting.as_bytes().to_vec()
    }

    fn consume(&mut self, bytes: &[u8]) -> Result<Consumed, SessionFault> {
        let mut out = Consumed::default();
        for line in self.lines.push(bytes)? {
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
