use getset::{CopyGetters, Getters};

use crate::{OvermountError, OvermountResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client process started through the engine.
///
/// The engine keeps the identifier around for the lifetime of the instance; a
/// detached reaper task owns the actual child handle and triggers unmount when
/// the process exits.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct SupervisedProcess {
    /// The application the process was started from.
    #[getset(get = "pub")]
    name: String,

    /// The operating-system process identifier.
    #[getset(get_copy = "pub")]
    pid: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SupervisedProcess {
    pub(crate) fn new(name: impl Into<String>, pid: u32) -> Self {
        Self {
            name: name.into(),
            pid,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Splits a command line into an argument vector.
///
/// Whitespace separates arguments; single and double quotes group them;
/// a backslash escapes the next character outside single quotes. An
/// unterminated quote is an error.
pub fn split_command_line(command_line: &str) -> OvermountResult<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    let mut chars = command_line.chars();
    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some('"') => match c {
                '"' => quote = None,
                '\\' => match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => {
                        return Err(OvermountError::UnbalancedQuotes(command_line.to_string()))
                    }
                },
                _ => current.push(c),
            },
            Some(_) => unreachable!("quote is only ever set to a single or double quote"),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                '\\' => {
                    in_word = true;
                    match chars.next() {
                        Some(escaped) => current.push(escaped),
                        None => current.push('\\'),
                    }
                }
                c if c.is_whitespace() => {
                    if in_word {
                        args.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    in_word = true;
                    current.push(c);
                }
            },
        }
    }

    if quote.is_some() {
        return Err(OvermountError::UnbalancedQuotes(command_line.to_string()));
    }

    if in_word {
        args.push(current);
    }

    Ok(args)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_arguments() -> anyhow::Result<()> {
        assert_eq!(
            split_command_line("-c beep --verbose")?,
            vec!["-c", "beep", "--verbose"]
        );
        assert_eq!(split_command_line("")?, Vec::<String>::new());
        assert_eq!(split_command_line("   ")?, Vec::<String>::new());
        Ok(())
    }

    #[test]
    fn test_split_quoted_arguments() -> anyhow::Result<()> {
        assert_eq!(
            split_command_line(r#"-c "exit 0" 'a b'"#)?,
            vec!["-c", "exit 0", "a b"]
        );
        assert_eq!(
            split_command_line(r#"a\ b "it's" '"'"#)?,
            vec!["a b", "it's", "\""]
        );
        Ok(())
    }

    #[test]
    fn test_split_rejects_unbalanced_quotes() {
        assert!(matches!(
            split_command_line("\"unterminated"),
            Err(OvermountError::UnbalancedQuotes(_))
        ));
        assert!(matches!(
            split_command_line("'unterminated"),
            Err(OvermountError::UnbalancedQuotes(_))
        ));
    }

    #[test]
    fn test_empty_quotes_produce_empty_argument() -> anyhow::Result<()> {
        assert_eq!(split_command_line(r#"'' x"#)?, vec!["", "x"]);
        Ok(())
    }
}
