//! Line-oriented operator consoles for the `netcalc` binary.
//!
//! Parsing is kept separate from I/O: [`parse_client_command`] and
//! [`parse_server_command`] are pure, the `run_*` loops only read lines and
//! print.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::client::{Client, ClientError};
use crate::datagram::{Mode, Operation, ResultId, ResultRecord, SessionId};
use crate::server::ServerHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("{command} expects {expected} argument(s)")]
    Arity {
        command: &'static str,
        expected: usize,
    },
    #[error("not a number: {0}")]
    Number(String),
}

/// A parsed client console line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientCommand {
    Operation { operation: Operation, a: f64, b: f64 },
    Session,
    Result(ResultId),
    Exit,
}

/// A parsed server console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    Session(SessionId),
    Kill(SessionId),
    Result(ResultId),
    Sessions,
    Exit,
}

pub const CLIENT_MENU: &str = "\
commands:
  power a b    a raised to b
  log a b      logarithm of b to base a
  GM a b       geometric mean of a and b
  aCb a b      a choose b
  session      every result of this session
  result <id>  one result of this session
  exit";

pub const SERVER_MENU: &str = "\
commands:
  session <id>  results of a session
  result <id>   one result, any session
  sessions      live sessions
  kill <id>     expire a session
  exit          stop the server";

pub fn parse_client_command(line: &str) -> Result<ClientCommand, ParseError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let (&command, args) = words.split_first().ok_or(ParseError::Empty)?;

    match command {
        "session" => {
            arity("session", args, 0)?;
            Ok(ClientCommand::Session)
        }
        "result" => {
            arity("result", args, 1)?;
            Ok(ClientCommand::Result(number(args[0])?))
        }
        "exit" => Ok(ClientCommand::Exit),
        other => {
            let operation: Operation = other
                .parse()
                .map_err(|_| ParseError::Unknown(other.to_string()))?;
            arity(operation.command(), args, 2)?;
            Ok(ClientCommand::Operation {
                operation,
                a: number(args[0])?,
                b: number(args[1])?,
            })
        }
    }
}

pub fn parse_server_command(line: &str) -> Result<ServerCommand, ParseError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let (&command, args) = words.split_first().ok_or(ParseError::Empty)?;

    match command {
        "session" => {
            arity("session", args, 1)?;
            Ok(ServerCommand::Session(number(args[0])?))
        }
        "result" => {
            arity("result", args, 1)?;
            Ok(ServerCommand::Result(number(args[0])?))
        }
        "kill" => {
            arity("kill", args, 1)?;
            Ok(ServerCommand::Kill(number(args[0])?))
        }
        "sessions" => {
            arity("sessions", args, 0)?;
            Ok(ServerCommand::Sessions)
        }
        "exit" => Ok(ServerCommand::Exit),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

fn arity(command: &'static str, args: &[&str], expected: usize) -> Result<(), ParseError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ParseError::Arity { command, expected })
    }
}

fn number<T: std::str::FromStr>(word: &str) -> Result<T, ParseError> {
    word.parse()
        .map_err(|_| ParseError::Number(word.to_string()))
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// Serve the client console until `exit`, end of input, or the probe finds
/// the connection dead.  Returns the client if it is still usable so the
/// caller can disconnect it.
pub async fn run_client<R>(client: Client, input: R) -> std::io::Result<Option<Client>>
where
    R: AsyncBufRead + Unpin,
{
    println!("{CLIENT_MENU}");
    let mut lines = input.lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = client.dead() => {
                println!("connection lost");
                return Ok(None);
            }
        };
        let Some(line) = line else {
            return Ok(Some(client));
        };

        let command = match parse_client_command(&line) {
            Ok(command) => command,
            Err(ParseError::Empty) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        match command {
            ClientCommand::Operation { operation, a, b } => {
                match client.operation(operation, a, b).await {
                    Ok(record) => print_value(&record),
                    Err(e) => print_client_error(Mode::Operation, &e),
                }
            }
            ClientCommand::Session => match client.query_by_session().await {
                Ok(records) => records.iter().for_each(print_record),
                Err(e) => print_client_error(Mode::QueryBySessionId, &e),
            },
            ClientCommand::Result(id) => match client.query_by_result(id).await {
                Ok(record) => print_record(&record),
                Err(e) => print_client_error(Mode::QueryByResultId, &e),
            },
            ClientCommand::Exit => return Ok(Some(client)),
        }
    }
}

/// Serve the server console until `exit` or end of input.  Does not stop
/// the server itself.
pub async fn run_server<R>(server: ServerHandle, input: R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    println!("{SERVER_MENU}");
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        let command = match parse_server_command(&line) {
            Ok(command) => command,
            Err(ParseError::Empty) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        match command {
            ServerCommand::Session(id) => match server.query_by_session(id) {
                Ok(records) => records.iter().for_each(print_record),
                Err(e) => println!("session {id}: {}", e.code()),
            },
            ServerCommand::Result(id) => match server.query_by_result(id) {
                Ok(record) => print_record(&record),
                Err(e) => println!("result {id}: {}", e.code()),
            },
            ServerCommand::Kill(id) => match server.expire(id) {
                Ok(()) => println!("session {id} expired"),
                Err(e) => println!("session {id}: {e}"),
            },
            ServerCommand::Sessions => {
                let sessions = server.sessions();
                if sessions.is_empty() {
                    println!("no live sessions");
                }
                for session in sessions {
                    println!("{}\t{}", session.id, session.address);
                }
            }
            ServerCommand::Exit => break,
        }
    }
    Ok(())
}

fn print_value(record: &ResultRecord) {
    println!("{}\t:{}", record.value, record.result_id);
}

fn print_record(record: &ResultRecord) {
    println!("{record}");
}

fn print_client_error(mode: Mode, e: &ClientError) {
    match e.code() {
        Some(code) => println!("{mode}: {code}"),
        None => println!("{mode}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_operations() {
        assert_eq!(
            parse_client_command("power 2 10"),
            Ok(ClientCommand::Operation {
                operation: Operation::Power,
                a: 2.0,
                b: 10.0
            })
        );
        assert_eq!(
            parse_client_command("  aCb   5 2 "),
            Ok(ClientCommand::Operation {
                operation: Operation::BinCoe,
                a: 5.0,
                b: 2.0
            })
        );
        assert!(matches!(
            parse_client_command("GM -1.5 4e2"),
            Ok(ClientCommand::Operation {
                operation: Operation::GeoMean,
                ..
            })
        ));
    }

    #[test]
    fn client_queries_and_exit() {
        assert_eq!(parse_client_command("session"), Ok(ClientCommand::Session));
        assert_eq!(parse_client_command("result 7"), Ok(ClientCommand::Result(7)));
        assert_eq!(parse_client_command("exit"), Ok(ClientCommand::Exit));
    }

    #[test]
    fn client_errors() {
        assert_eq!(parse_client_command("   "), Err(ParseError::Empty));
        assert_eq!(
            parse_client_command("sqrt 4 2"),
            Err(ParseError::Unknown("sqrt".into()))
        );
        assert_eq!(
            parse_client_command("log 2"),
            Err(ParseError::Arity {
                command: "log",
                expected: 2
            })
        );
        assert_eq!(
            parse_client_command("power two 3"),
            Err(ParseError::Number("two".into()))
        );
        assert_eq!(
            parse_client_command("result -1"),
            Err(ParseError::Number("-1".into()))
        );
    }

    #[test]
    fn operation_names_are_case_sensitive() {
        assert!(parse_client_command("gm 1 2").is_err());
        assert!(parse_client_command("POWER 1 2").is_err());
    }

    #[test]
    fn server_commands() {
        assert_eq!(parse_server_command("session 3"), Ok(ServerCommand::Session(3)));
        assert_eq!(parse_server_command("result 12"), Ok(ServerCommand::Result(12)));
        assert_eq!(parse_server_command("sessions"), Ok(ServerCommand::Sessions));
        assert_eq!(parse_server_command("kill 4"), Ok(ServerCommand::Kill(4)));
        assert_eq!(parse_server_command("exit"), Ok(ServerCommand::Exit));
        assert_eq!(
            parse_server_command("session"),
            Err(ParseError::Arity {
                command: "session",
                expected: 1
            })
        );
        assert_eq!(
            parse_server_command("session 70000"),
            Err(ParseError::Number("70000".into()))
        );
        assert_eq!(
            parse_server_command("power 1 2"),
            Err(ParseError::Unknown("power".into()))
        );
    }
}
