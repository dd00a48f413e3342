//! Schema-aware database dumpers
//!
//! Renders the key-value pairs of a database as JSON text in one of
//! five modes:
//!
//! - `keys` / `values`: a JSON array of only the keys or values
//! - `nice`: struct-aware, strips the trailing NUL from probable
//!   C-strings (readable but ambiguous)
//! - `simple`: every value as an escaped byte string (unambiguous
//!   fallback for arbitrary data)
//! - `portable`: struct-aware but without string stripping
//!
//! Struct decoding is selected by the filename stem; a record whose
//! size does not match the expected struct falls back to `simple`
//! rendering. Optionally the collected tree can be rendered through a
//! mustache template instead of the default JSON layout.

use std::io::Write;
use std::path::Path;

use serde_json::{json, Map, Value};

use fleetstate_core::cstr::from_loose_c_bytes;
use fleetstate_core::records::{Averages, KeyHostSeen, LockData, PersistentClassInfo};
use fleetstate_core::{observables, Error, Result};
use fleetstate_store::engine::{Engine, EngineOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    Keys,
    Values,
    /// Strings stripped, structs decoded
    Nice,
    /// Escaped byte strings only
    Simple,
    /// Structs decoded, strings kept raw
    Portable,
}

impl DumpMode {
    fn strip_strings(self) -> bool {
        self == DumpMode::Nice
    }

    fn decode_structs(self) -> bool {
        matches!(self, DumpMode::Nice | DumpMode::Portable)
    }
}

/// Escape arbitrary bytes for inclusion in a JSON string literal.
/// Non-printable and non-ASCII bytes become `\u00xx` escapes, so the
/// output is unambiguous whatever the value contained.
fn escape_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\u{:04x}", b)),
        }
    }
    out
}

/// Render bytes as a JSON string, optionally stripping the trailing NUL
/// from what looks like a stored C-string.
///
/// In nice mode, data that is neither a single-byte flag, a
/// NUL-terminated string nor newline-terminated text is refused: the
/// caller should retry with `--simple`.
fn json_string(data: &[u8], strip_strings: bool) -> Result<String> {
    if data.is_empty() {
        return Ok("\"\"".to_string());
    }

    let mut data = data;
    if strip_strings {
        let nul_len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        let known = data.len() == 1
            || nul_len == data.len() - 1
            || data[data.len() - 1] == b'\n';
        if !known {
            return Err(Error::internal(
                "this database contains unknown binary data - use --simple to print anyway, \
                 or dump on the OS/architecture the file was generated on",
            ));
        }
        if data.len() > 1 && nul_len == data.len() - 1 {
            data = &data[..nul_len];
        }
    }

    Ok(format!("\"{}\"", escape_bytes(data)))
}

/// Decode a value by the owning file's schema. `None` means "no schema
/// for this record"; the caller falls back to string rendering.
fn decode_struct(
    file: &str,
    key: &[u8],
    value: &[u8],
    observable_names: &[String],
) -> Option<Value> {
    let key_str = from_loose_c_bytes(key).unwrap_or("");

    if file.contains("cf_lastseen.lmdb") && key_str.starts_with('q') {
        let seen = KeyHostSeen::from_bytes(value)?;
        return Some(json!({
            "lastseen": seen.lastseen,
            "Q": {
                "q": seen.q.q,
                "expect": seen.q.expect,
                "var": seen.q.var,
                "dq": seen.q.dq,
            },
        }));
    }

    if file.contains("cf_lock.lmdb") {
        let lock = LockData::from_bytes(value)?;
        return Some(json!({
            "pid": lock.pid,
            "time": lock.time,
            "process_start_time": lock.process_start_time,
        }));
    }

    if file.contains("cf_observations.lmdb") {
        if key_str == "DATABASE_AGE" {
            return decode_f64(value);
        }
        return decode_averages(value, observable_names);
    }

    if file.ends_with("history.lmdb") || file.ends_with("history.lmdb.backup") {
        return decode_averages(value, observable_names);
    }

    if file.contains("cf_state.lmdb") {
        let info = PersistentClassInfo::from_bytes(value)?;
        return Some(json!({
            "expires": info.expires,
            "policy": info.policy.as_str(),
            "tags": info.tags,
        }));
    }

    if file.contains("nova_agent_execution.lmdb") {
        return match key_str {
            "delta_gavr" => decode_f64(value),
            "last_exec" => {
                let bytes: [u8; 8] = value.try_into().ok()?;
                Some(json!(i64::from_ne_bytes(bytes)))
            }
            _ => None,
        };
    }

    None
}

fn decode_f64(value: &[u8]) -> Option<Value> {
    let bytes: [u8; 8] = value.try_into().ok()?;
    Some(json!(f64::from_ne_bytes(bytes)))
}

fn decode_averages(value: &[u8], observable_names: &[String]) -> Option<Value> {
    let averages = Averages::from_bytes(value)?;
    let mut q = Map::new();
    for (i, point) in averages.q.iter().enumerate() {
        let name = observable_names
            .get(i)
            .map(String::as_str)
            .unwrap_or("spare");
        q.insert(
            name.to_string(),
            json!({
                "q": point.q,
                "expect": point.expect,
                "var": point.var,
                "dq": point.dq,
            }),
        );
    }
    Some(json!({
        "last_seen": averages.last_seen,
        "Q": Value::Object(q),
    }))
}

/// Render one value: decoded struct where the schema is known and the
/// size matches, escaped string otherwise.
fn value_text(
    file: &str,
    key: &[u8],
    value: &[u8],
    mode: DumpMode,
    observable_names: &[String],
) -> Result<String> {
    if mode.decode_structs() {
        if let Some(decoded) = decode_struct(file, key, value, observable_names) {
            return serde_json::to_string(&decoded)
                .map_err(|e| Error::internal(format!("serialize dump record: {e}")));
        }
    }
    json_string(value, mode.strip_strings())
}

/// Dump one database to `out`
pub fn dump_file(
    path: &Path,
    mode: DumpMode,
    tskey_file: Option<&Path>,
    out: &mut dyn Write,
) -> Result<()> {
    let observable_names = observables::names(tskey_file);
    let file = path.to_string_lossy().into_owned();

    let options = EngineOptions {
        read_only: true,
        ..Default::default()
    };
    let engine = Engine::open(path, &options)?;

    let (open_bracket, close_bracket) = match mode {
        DumpMode::Keys | DumpMode::Values => ("[", "]"),
        _ => ("{", "}"),
    };

    writeln!(out, "{open_bracket}").map_err(|e| Error::io("write dump", e))?;
    engine.scan(|key, value| {
        let line = match mode {
            DumpMode::Keys => format!("\t{},", json_string(key, mode.strip_strings())?),
            DumpMode::Values => format!("\t{},", json_string(value, mode.strip_strings())?),
            DumpMode::Nice | DumpMode::Simple | DumpMode::Portable => format!(
                "\t{}: {},",
                json_string(key, mode.strip_strings())?,
                value_text(&file, key, value, mode, &observable_names)?
            ),
        };
        writeln!(out, "{line}").map_err(|e| Error::io("write dump", e))
    })?;
    writeln!(out, "{close_bracket}").map_err(|e| Error::io("write dump", e))?;

    Ok(())
}

/// Collect one database into a JSON tree (used for template output)
fn collect_file(
    path: &Path,
    tskey_file: Option<&Path>,
) -> Result<Value> {
    let observable_names = observables::names(tskey_file);
    let file = path.to_string_lossy().into_owned();

    let options = EngineOptions {
        read_only: true,
        ..Default::default()
    };
    let engine = Engine::open(path, &options)?;

    let mut records = Map::new();
    engine.scan(|key, value| {
        let key_name = from_loose_c_bytes(key)
            .map(|s| s.to_string())
            .unwrap_or_else(|| escape_bytes(key));
        let decoded = decode_struct(&file, key, value, &observable_names)
            .unwrap_or_else(|| match from_loose_c_bytes(value) {
                Some(text) => Value::String(text.to_string()),
                None => Value::String(escape_bytes(value)),
            });
        records.insert(key_name, decoded);
        Ok(())
    })?;

    Ok(json!({
        "file": file,
        "records": Value::Object(records),
    }))
}

/// Dump several databases; each is prefixed with its filename when more
/// than one is given. Returns the first error after attempting every
/// file.
pub fn dump_files(
    files: &[std::path::PathBuf],
    mode: DumpMode,
    tskey_file: Option<&Path>,
    template: Option<&str>,
    out: &mut dyn Write,
) -> Result<()> {
    let mut first_error = None;

    for path in files {
        if files.len() > 1 {
            writeln!(out, "{}:", path.display()).map_err(|e| Error::io("write dump", e))?;
        }

        let result = match template {
            Some(template) => collect_file(path, tskey_file).and_then(|tree| {
                let rendered = fleetstate_template::render(template, &tree)
                    .map_err(|e| Error::internal(e.to_string()))?;
                out.write_all(rendered.as_bytes())
                    .map_err(|e| Error::io("write dump", e))
            }),
            None => dump_file(path, mode, tskey_file, out),
        };

        if let Err(err) = result {
            tracing::error!("dump of '{}' failed: {err}", path.display());
            if first_error.is_none() {
                first_error = Some(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
