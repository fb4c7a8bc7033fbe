//! Slash commands typed at the prompt.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};

pub const HELP: &str = "\
commands:
  /connect <host> <port> <user>   ask a peer to connect
  /accept <user>                  accept a pending request
  /refuse <user>                  refuse a pending request
  /send <user> <text>             send a message
  /file <user> <path>             send a file (10 MiB max)
  /disconnect <user>              close a connection
  /peers                          list known peers
  /key                            show our public key fingerprint
  /quit                           disconnect everyone and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect {
        host: String,
        port: u16,
        username: String,
    },
    Accept(String),
    Refuse(String),
    Send {
        username: String,
        text: String,
    },
    File {
        username: String,
        path: PathBuf,
    },
    Disconnect(String),
    Peers,
    Key,
    Help,
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            bail!("commands start with '/', try /help");
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        let command = match name {
            "connect" => {
                let [host, port, username] = words::<3>(args, "/connect <host> <port> <user>")?;
                let port = port
                    .parse()
                    .map_err(|_| anyhow!("invalid port: {port}"))?;
                Command::Connect {
                    host: host.to_string(),
                    port,
                    username: username.to_string(),
                }
            }
            "accept" => Command::Accept(one(args, "/accept <user>")?),
            "refuse" => Command::Refuse(one(args, "/refuse <user>")?),
            "disconnect" => Command::Disconnect(one(args, "/disconnect <user>")?),
            "send" | "msg" => {
                let (username, text) = split_target(args, "/send <user> <text>")?;
                Command::Send {
                    username,
                    text: text.to_string(),
                }
            }
            "file" => {
                let (username, path) = split_target(args, "/file <user> <path>")?;
                Command::File {
                    username,
                    path: PathBuf::from(path),
                }
            }
            "peers" => Command::Peers,
            "key" => Command::Key,
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => bail!("unknown command /{other}, try /help"),
        };
        Ok(Some(command))
    }
}

fn words<'a, const N: usize>(args: &'a str, usage: &str) -> Result<[&'a str; N]> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    parts
        .try_into()
        .map_err(|_| anyhow!("usage: {usage}"))
}

fn one(args: &str, usage: &str) -> Result<String> {
    let [value] = words::<1>(args, usage)?;
    Ok(value.to_string())
}

/// First word is the user, the rest is kept verbatim.
fn split_target<'a>(args: &'a str, usage: &str) -> Result<(String, &'a str)> {
    match args.split_once(char::is_whitespace) {
        Some((user, rest)) if !rest.trim().is_empty() => Ok((user.to_string(), rest.trim())),
        _ => bail!("usage: {usage}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect() {
        assert_eq!(
            Command::parse("/connect 192.168.1.20 5555 bob").unwrap(),
            Some(Command::Connect {
                host: "192.168.1.20".into(),
                port: 5555,
                username: "bob".into(),
            })
        );
        assert!(Command::parse("/connect 192.168.1.20 bob").is_err());
        assert!(Command::parse("/connect host 99999 bob").is_err());
    }

    #[test]
    fn send_keeps_text_verbatim() {
        assert_eq!(
            Command::parse("/send bob  hello   there ").unwrap(),
            Some(Command::Send {
                username: "bob".into(),
                text: "hello   there".into(),
            })
        );
        assert!(Command::parse("/send bob").is_err());
    }

    #[test]
    fn file_path_may_contain_spaces() {
        assert_eq!(
            Command::parse("/file alice ./my notes.txt").unwrap(),
            Some(Command::File {
                username: "alice".into(),
                path: PathBuf::from("./my notes.txt"),
            })
        );
    }

    #[test]
    fn simple_commands() {
        assert_eq!(Command::parse("   ").unwrap(), None);
        assert_eq!(Command::parse("/peers").unwrap(), Some(Command::Peers));
        assert_eq!(Command::parse("/quit").unwrap(), Some(Command::Quit));
        assert_eq!(
            Command::parse("/accept bob").unwrap(),
            Some(Command::Accept("bob".into()))
        );
        assert!(Command::parse("/accept").is_err());
        assert!(Command::parse("/accept bob carol").is_err());
        assert!(Command::parse("hello").is_err());
        assert!(Command::parse("/dance").is_err());
    }
}
