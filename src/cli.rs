//! Interactive prompt of the command line client.
use std::io::{BufRead, Write};

use crate::protocol::QualifiedTableName;

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `.exit`, or end of input
    Exit,
    /// `.ping`
    Ping,
    /// `.tables [db.]table ...`
    TablesStatus(Vec<QualifiedTableName>),
    /// Anything else is sent to the server as a query.
    Query(String),
}

fn table_name(s: &str) -> QualifiedTableName {
    match s.split_once('.') {
        Some((database, table)) => QualifiedTableName {
            database: database.to_string(),
            table: table.to_string(),
        },
        None => QualifiedTableName {
            database: "default".to_string(),
            table: s.to_string(),
        },
    }
}

/// Prompt user for a command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, String>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ").map_err(|e| format!("failed to write prompt: {e}"))?;
    writer
        .flush()
        .map_err(|e| format!("failed to write prompt: {e}"))?;

    let read = reader
        .read_line(&mut s)
        .map_err(|e| format!("failed to read input: {e}"))?;
    if read == 0 {
        return Ok(Command::Exit);
    }

    let mut words = s.split_whitespace();
    match words.next() {
        Some(".exit") => Ok(Command::Exit),
        Some(".ping") => Ok(Command::Ping),
        Some(".tables") => Ok(Command::TablesStatus(words.map(table_name).collect())),
        Some(c) if c.starts_with('.') => Err(format!("unrecognized command '{}'", s.trim_end())),
        _ => Ok(Command::Query(s.trim().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_handles_queries() {
        let input = b"SELECT 1\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(Command::Query("SELECT 1".to_string()), res);
    }

    #[test]
    fn prompt_parses_table_names() {
        let input = b".tables t other.u\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(
            Command::TablesStatus(vec![
                QualifiedTableName {
                    database: "default".to_string(),
                    table: "t".to_string()
                },
                QualifiedTableName {
                    database: "other".to_string(),
                    table: "u".to_string()
                },
            ]),
            res
        );
    }

    #[test]
    fn end_of_input_exits() {
        let mut output = Vec::new();

        assert_eq!(prompt(&b""[..], &mut output).unwrap(), Command::Exit);
    }

    #[test]
    #[should_panic(expected = "unrecognized command '.something_wrong'")]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();
    }
}
