//! Line-oriented index file helpers shared by the persisted backends.
//!
//! Every index file is newline-delimited; list lines use `;` between values.
//! Writers go through a `.tmp` sibling and a rename so a crashed build never
//! leaves a half-written file under the final name.

use crate::error::{Result, SearchError};
use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Separator between values on one line.
pub const LIST_SEPARATOR: char = ';';

/// True when every path exists.
pub fn all_exist(paths: &[&Path]) -> bool {
    paths.iter().all(|p| p.is_file())
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| SearchError::io(dir, e))
}

/// Write `lines` to `path`, one per line.
pub fn write_lines<I, S>(path: &Path, lines: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let tmp = tmp_path(path);
    let file = File::create(&tmp).map_err(|e| SearchError::io(&tmp, e))?;
    let mut writer = BufWriter::new(file);
    for line in lines {
        writer
            .write_all(line.as_ref().as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .map_err(|e| SearchError::io(&tmp, e))?;
    }
    writer.flush().map_err(|e| SearchError::io(&tmp, e))?;
    drop(writer);
    fs::rename(&tmp, path).map_err(|e| SearchError::io(path, e))
}

pub fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).map_err(|e| SearchError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| SearchError::io(path, e))
}

pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| SearchError::io(path, e))
}

/// All lines of `path`.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| SearchError::io(path, e))?;
    BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| SearchError::io(path, e))
}

/// Join values with the list separator.
pub fn join_list<T: Display>(values: impl IntoIterator<Item = T>) -> String {
    let mut out = String::new();
    for (i, v) in values.into_iter().enumerate() {
        if i > 0 {
            out.push(LIST_SEPARATOR);
        }
        out.push_str(&v.to_string());
    }
    out
}

/// Parse one value; `line` is 1-based for error messages.
pub fn parse_value<T: FromStr>(text: &str, path: &Path, line: usize) -> Result<T> {
    text.trim()
        .parse::<T>()
        .map_err(|_| SearchError::malformed(path, line, format!("cannot parse '{}'", text)))
}

/// Parse a separator-delimited line. An empty line is an empty list.
pub fn parse_list<T: FromStr>(text: &str, path: &Path, line: usize) -> Result<Vec<T>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(LIST_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(|s| parse_value(s, path, line))
        .collect()
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lines_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.ids");
        write_lines(&path, ["1", "2", "30"]).unwrap();
        assert_eq!(read_lines(&path).unwrap(), vec!["1", "2", "30"]);
        assert!(!dir.path().join("x.ids.tmp").exists());
    }

    #[test]
    fn test_parse_list() {
        let p = Path::new("f");
        assert_eq!(parse_list::<i32>("1;-2;3", p, 1).unwrap(), vec![1, -2, 3]);
        assert_eq!(parse_list::<i32>("", p, 1).unwrap(), Vec::<i32>::new());
        assert_eq!(parse_list::<i32>("4;5;", p, 1).unwrap(), vec![4, 5]);
        assert!(matches!(
            parse_list::<i32>("1;x", p, 9),
            Err(SearchError::MalformedIndex { line: 9, .. })
        ));
        assert_eq!(join_list([1, 2, 3]), "1;2;3");
    }
}
