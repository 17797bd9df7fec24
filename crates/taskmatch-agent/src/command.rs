//! Stdin command parsing.

use thiserror::Error;

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Online,
    Offline,
    Accept,
    Decline { reason: String },
    Dismiss,
    Arrive,
    Start,
    Complete { otp: String },
    Cancel { reason: Option<String> },
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{0} needs an argument")]
    MissingArgument(&'static str),
}

impl Command {
    /// Parse a line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let argument = (!rest.is_empty()).then(|| rest.to_string());

        let command = match word.to_ascii_lowercase().as_str() {
            "online" => Self::Online,
            "offline" => Self::Offline,
            "accept" => Self::Accept,
            "decline" => Self::Decline {
                reason: argument.ok_or(CommandError::MissingArgument("decline"))?,
            },
            "dismiss" => Self::Dismiss,
            "arrive" => Self::Arrive,
            "start" => Self::Start,
            "complete" => Self::Complete {
                otp: argument.ok_or(CommandError::MissingArgument("complete"))?,
            },
            "cancel" => Self::Cancel { reason: argument },
            "quit" | "exit" => Self::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("online").unwrap(), Some(Command::Online));
        assert_eq!(
            Command::parse("decline  too far away ").unwrap(),
            Some(Command::Decline {
                reason: "too far away".into()
            })
        );
        assert_eq!(
            Command::parse("complete 4821").unwrap(),
            Some(Command::Complete { otp: "4821".into() })
        );
        assert_eq!(
            Command::parse("cancel").unwrap(),
            Some(Command::Cancel { reason: None })
        );
        assert_eq!(Command::parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Command::parse("complete"),
            Err(CommandError::MissingArgument("complete"))
        );
        assert_eq!(
            Command::parse("fly"),
            Err(CommandError::Unknown("fly".into()))
        );
    }
}
