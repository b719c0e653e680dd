use packvault_core::bootstrap::confirm_password;
use packvault_core::{Error, Result};
use std::io::{self, BufRead, IsTerminal};
use std::path::Path;
use zeroize::Zeroizing;

/// Where a password comes from, in order of precedence.
#[derive(Debug, Clone, Copy, Default)]
pub struct PasswordSource<'a> {
    pub value: Option<&'a str>,
    pub file: Option<&'a Path>,
}

impl PasswordSource<'_> {
    fn is_explicit(&self) -> bool {
        self.value.is_some() || self.file.is_some()
    }
}

/// Reads a password once: flag or env value, then file, then `prompt`.
pub fn read_password<P>(
    source: PasswordSource<'_>,
    message: &str,
    mut prompt: P,
) -> Result<Zeroizing<String>>
where
    P: FnMut(&str) -> Result<Zeroizing<String>>,
{
    if let Some(value) = source.value {
        return Ok(Zeroizing::new(value.to_string()));
    }
    if let Some(path) = source.file {
        return read_password_file(path);
    }
    prompt(message)
}

/// Reads a new password. Interactive entry is asked twice and both entries
/// must match; explicit sources are taken as given.
pub fn read_new_password<P>(
    source: PasswordSource<'_>,
    message: &str,
    confirm_message: &str,
    mut prompt: P,
) -> Result<Zeroizing<String>>
where
    P: FnMut(&str) -> Result<Zeroizing<String>>,
{
    let first = read_password(source, message, &mut prompt)?;
    if source.is_explicit() {
        if first.is_empty() {
            return Err(Error::InvalidRequest(
                "empty passwords are not allowed".to_string(),
            ));
        }
        return Ok(first);
    }

    let second = prompt(confirm_message)?;
    confirm_password(&first, &second)?;
    Ok(first)
}

fn read_password_file(path: &Path) -> Result<Zeroizing<String>> {
    let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
        Error::InvalidRequest(format!("cannot read password file {}: {e}", path.display()))
    })?);
    let line = contents.lines().next().unwrap_or_default();
    Ok(Zeroizing::new(line.to_string()))
}

/// Reads from the terminal without echo, or one line of stdin when it is
/// not a terminal.
pub fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    if io::stdin().is_terminal() {
        return Ok(Zeroizing::new(rpassword::prompt_password(prompt)?));
    }

    let mut line = Zeroizing::new(String::new());
    io::stdin().lock().read_line(&mut line)?;
    let trimmed = line.trim_end_matches(['\r', '\n']);
    Ok(Zeroizing::new(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_value_takes_precedence() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "from-file\n").unwrap();
        let source = PasswordSource {
            value: Some("from-flag"),
            file: Some(file.path()),
        };
        assert_eq!(read_password(source, "", prompt_password).unwrap().as_str(), "from-flag");
    }

    #[test]
    fn test_file_first_line_only() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "secret\r\nignored\n").unwrap();
        let source = PasswordSource {
            value: None,
            file: Some(file.path()),
        };
        assert_eq!(read_password(source, "", prompt_password).unwrap().as_str(), "secret");
    }

    #[test]
    fn test_explicit_new_password_must_not_be_empty() {
        let source = PasswordSource {
            value: Some(""),
            file: None,
        };
        assert!(matches!(
            read_new_password(source, "", "", prompt_password),
            Err(Error::InvalidRequest(_))
        ));
    }

    /// Answers prompts from a fixed list of entries.
    fn scripted(entries: &[&str]) -> impl FnMut(&str) -> Result<Zeroizing<String>> {
        let mut entries: Vec<String> = entries.iter().rev().map(|e| e.to_string()).collect();
        move |_| {
            entries
                .pop()
                .map(Zeroizing::new)
                .ok_or_else(|| Error::InvalidRequest("no more entries".to_string()))
        }
    }

    #[test]
    fn test_interactive_new_password_is_confirmed() {
        let source = PasswordSource::default();
        assert!(matches!(
            read_new_password(source, "", "", scripted(&["alpha", "beta"])),
            Err(Error::PasswordMismatch)
        ));
        let password = read_new_password(source, "", "", scripted(&["alpha", "alpha"])).unwrap();
        assert_eq!(password.as_str(), "alpha");
    }

    #[test]
    fn test_explicit_new_password_is_not_prompted() {
        let source = PasswordSource {
            value: Some("given"),
            file: None,
        };
        let password = read_new_password(source, "", "", scripted(&[])).unwrap();
        assert_eq!(password.as_str(), "given");
    }

    #[test]
    fn test_missing_file_is_invalid_request() {
        let source = PasswordSource {
            value: None,
            file: Some(Path::new("/nonexistent/packvault/password")),
        };
        assert!(matches!(read_password(source, "", prompt_password), Err(Error::InvalidRequest(_))));
    }
}
