#![allow(clippy::module_name_repetitions)]
//! Small utilities: shell quoting for log lines and shell-style tokenization of fork requests.

pub mod fs;

use crate::errors::ParseError;

pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_escape(a))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_=./:@".contains(c))
    {
        s.to_string()
    } else {
        let escaped = s.replace('\'', "'\"'\"'");
        format!("'{}'", escaped)
    }
}

/// POSIX-shell-like tokenizer for `fork` command lines.
///
/// Single quotes preserve everything literally. Double quotes preserve spaces and
/// honour backslash escapes of `"`, `\`, `$` and `` ` ``. Outside quotes a backslash
/// escapes the next character. Unterminated quotes and a trailing backslash are errors.
pub fn shell_split(s: &str) -> Result<Vec<String>, ParseError> {
    let mut out: Vec<String> = Vec::new();
    let mut current = String::new();
    // Distinguishes `''` (an empty argument) from no argument at all.
    let mut in_word = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = s.chars();

    while let Some(ch) = chars.next() {
        if in_single {
            if ch == '\'' {
                in_single = false;
            } else {
                current.push(ch);
            }
            continue;
        }
        if in_double {
            match ch {
                '"' => in_double = false,
                '\\' => match chars.next() {
                    Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                    Some(c) => {
                        current.push('\\');
                        current.push(c);
                    }
                    None => return Err(ParseError::new("No closing quotation")),
                },
                c => current.push(c),
            }
            continue;
        }
        match ch {
            '\'' => {
                in_single = true;
                in_word = true;
            }
            '"' => {
                in_double = true;
                in_word = true;
            }
            '\\' => match chars.next() {
                Some(c) => {
                    current.push(c);
                    in_word = true;
                }
                None => return Err(ParseError::new("No escaped character")),
            },
            c if c.is_whitespace() => {
                if in_word {
                    out.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_single || in_double {
        return Err(ParseError::new("No closing quotation"));
    }
    if in_word {
        out.push(current);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape_simple() {
        assert_eq!(shell_escape("abc-123_./:@"), "abc-123_./:@");
    }

    #[test]
    fn test_shell_escape_with_spaces_and_quotes() {
        assert_eq!(shell_escape("a b c"), "'a b c'");
        assert_eq!(shell_escape("O'Reilly"), "'O'\"'\"'Reilly'");
    }

    #[test]
    fn test_shell_join() {
        let args = vec!["a".to_string(), "b c".to_string(), "d".to_string()];
        assert_eq!(shell_join(&args), "a 'b c' d");
    }

    #[test]
    fn test_shell_split_quotes_and_spaces() {
        let args = shell_split("'a b' c \"d e\"").unwrap();
        assert_eq!(
            args,
            vec!["a b".to_string(), "c".to_string(), "d e".to_string()]
        );

        let args2 = shell_split("  a   'b c'   d  ").unwrap();
        assert_eq!(
            args2,
            vec!["a".to_string(), "b c".to_string(), "d".to_string()]
        );
    }

    #[test]
    fn test_shell_split_escapes_and_empty_args() {
        assert_eq!(
            shell_split(r#"echo a\ b "x\"y" 'it''s' ''"#).unwrap(),
            vec!["echo", "a b", "x\"y", "its", ""]
        );
        assert_eq!(shell_split(r#""a\nb""#).unwrap(), vec!["a\\nb"]);
        assert!(shell_split("").unwrap().is_empty());
    }

    #[test]
    fn test_shell_split_rejects_unbalanced_input() {
        assert_eq!(
            shell_split("echo 'oops").unwrap_err().reason,
            "No closing quotation"
        );
        assert_eq!(
            shell_split("echo \"oops").unwrap_err().reason,
            "No closing quotation"
        );
        assert_eq!(
            shell_split("echo oops\\").unwrap_err().reason,
            "No escaped character"
        );
    }

    #[test]
    fn test_shell_join_then_split_preserves_words() {
        let words = vec!["sh".to_string(), "-c".to_string(), "echo it's".to_string()];
        assert_eq!(shell_split(&shell_join(&words)).unwrap(), words);
    }
}
