//! `.env` file support: `KEY=value` lines, optional `export` prefix, `#` comments, single- or
//! double-quoted values. Variables already set in the process environment are left alone.

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct LoadedEnvFile {
    pub path: PathBuf,
    pub explicit: bool,
}

/// Parse command-line arguments (`--env-file <path>` / `--env-file=<path>`) and load the
/// selected file, or `./.env` when present.
pub fn load_from_args<I>(args: I) -> Result<Option<LoadedEnvFile>, String>
where
    I: IntoIterator<Item = std::ffi::OsString>,
{
    let mut explicit: Option<PathBuf> = None;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let arg = arg.into_string().map_err(|_| "argument contains invalid UTF-8".to_string())?;
        let value = match arg.as_str() {
            "--" => break,
            "--env-file" => args
                .next()
                .and_then(|v| v.into_string().ok())
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            other => match other.strip_prefix("--env-file=") {
                Some(path) if !path.is_empty() => path.to_string(),
                Some(_) => return Err("`--env-file` requires a path argument".to_string()),
                None => return Err(format!("unrecognised argument: {}", other)),
            },
        };
        if explicit.replace(PathBuf::from(value)).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }

    let (path, explicit) = match explicit {
        Some(path) if path.is_file() => (path, true),
        Some(path) => return Err(format!("env file not found: {}", path.display())),
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let path = cwd.join(".env");
            if !path.is_file() {
                return Ok(None);
            }
            (path, false)
        }
    };
    apply(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit }))
}

fn apply(path: &Path) -> Result<(), String> {
    let content = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (key, value) in parse(&content).map_err(|e| format!("{}:{}", path.display(), e))? {
        if std::env::var_os(&key).is_none() {
            // set_var is unsound while other threads read the environment; only called at startup
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Parse a whole file into ordered assignments. Errors carry the 1-based line number.
pub fn parse(content: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if let Some(pair) = parse_line(line).map_err(|e| format!("{}: {}", index + 1, e))? {
            out.push(pair);
        }
    }
    Ok(out)
}

fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.contains(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }
    Ok(Some((key.to_string(), parse_value(raw.trim())?)))
}

fn parse_value(raw: &str) -> Result<String, String> {
    let mut chars = raw.chars();
    let quote = match chars.next() {
        Some(q @ ('"' | '\'')) => q,
        _ => {
            let unquoted = raw.split('#').next().unwrap_or_default();
            return Ok(unquoted.trim_end().to_string());
        }
    };

    let mut value = String::new();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if quote == '"' => match chars.next() {
                Some('n') => value.push('\n'),
                Some('r') => value.push('\r'),
                Some('t') => value.push('\t'),
                Some(other) => value.push(other),
                None => return Err("unterminated escape sequence in double-quoted value".to_string()),
            },
            c if c == quote => {
                let rest = chars.as_str().trim();
                if rest.is_empty() || rest.starts_with('#') {
                    return Ok(value);
                }
                return Err(format!("unexpected characters after closing {} quote", quote));
            }
            other => value.push(other),
        }
    }
    Err(format!("unterminated {}-quoted value", quote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assignments() {
        let parsed = parse(
            "# bridge account\nexport DKN_USERNAME=me@example.com # inline\n\nDKN_PASSWORD=\"p\\\"w\\td\"\nWORKDAY_NAME='Office days'\nEMPTY=\n",
        )
        .unwrap();
        assert_eq!(
            parsed,
            vec![
                ("DKN_USERNAME".to_string(), "me@example.com".to_string()),
                ("DKN_PASSWORD".to_string(), "p\"w\td".to_string()),
                ("WORKDAY_NAME".to_string(), "Office days".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn reports_line_numbers() {
        let err = parse("A=1\nB='open\n").unwrap_err();
        assert!(err.starts_with("2: unterminated"), "{err}");
        assert!(parse("NO_EQUALS\n").is_err());
        assert!(parse("BAD KEY=1\n").is_err());
        assert!(parse("A=\"x\" trailing\n").is_err());
    }

    #[test]
    fn rejects_unknown_arguments() {
        let err = load_from_args(vec!["--verbose".into()]).unwrap_err();
        assert!(err.contains("unrecognised"), "{err}");
        let err = load_from_args(vec!["--env-file".into(), "a".into(), "--env-file=b".into()]).unwrap_err();
        assert!(err.contains("more than once"), "{err}");
        let err = load_from_args(vec!["--env-file=/nonexistent/.env".into()]).unwrap_err();
        assert!(err.contains("not found"), "{err}");
    }
}
