//! Template functions (global functions available in templates)
//!
//! Side-effecting functions (`read_file`, `exec`) are bound per renderer in
//! [`crate::engine`]; the helpers they delegate to live here.

use minijinja::value::Rest;
use minijinja::{Error, ErrorKind, State, Value};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::runtime::{Builder, Handle, RuntimeFlavor};

use crate::engine::ReadFileFn;

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.into())
}

fn to_json(value: &Value) -> Result<JsonValue, Error> {
    serde_json::to_value(value).map_err(|e| invalid(e.to_string()))
}

/// Read a file relative to the renderer's base directory
pub fn read_file(reader: &ReadFileFn, base_dir: &Path, path: &str) -> Result<String, Error> {
    let full = if Path::new(path).is_absolute() {
        Path::new(path).to_path_buf()
    } else {
        base_dir.join(path)
    };
    reader(&full).map_err(|e| invalid(format!("read_file: {}: {}", full.display(), e)))
}

/// Run a command in `dir`, optionally feeding `stdin`, and return stdout
pub fn exec(dir: &Path, command: &str, args: &[Value], stdin: Option<&str>) -> Result<String, Error> {
    let mut str_args = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        match arg.as_str() {
            Some(s) => str_args.push(s.to_string()),
            None => {
                return Err(invalid(format!(
                    "exec: argument {} must be a string, got {:?}",
                    i,
                    arg.kind()
                )));
            }
        }
    }

    block_on(run_command(
        dir.to_path_buf(),
        command.to_string(),
        str_args,
        stdin.map(str::to_string),
    ))?
}

async fn run_command(dir: PathBuf, command: String, args: Vec<String>, stdin: Option<String>) -> Result<String, Error> {
    let mut child = Command::new(&command)
        .args(&args)
        .current_dir(&dir)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| invalid(format!("exec: failed to start `{}`: {}", command, e)))?;

    // Fed concurrently with the read so a full stdout pipe cannot deadlock us.
    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
            pipe.write_all(input.as_bytes()).await?;
        }
        Ok::<(), std::io::Error>(())
    };
    let (written, output) = tokio::join!(feed, child.wait_with_output());

    let output = output.map_err(|e| invalid(format!("exec: `{}`: {}", command, e)))?;
    written.map_err(|e| invalid(format!("exec: writing stdin of `{}`: {}", command, e)))?;

    if !output.status.success() {
        return Err(invalid(format!(
            "exec: command `{} {}` failed with {}: {}",
            command,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Drive `future` from a synchronous template call
fn block_on<F>(future: F) -> Result<F::Output, Error>
where
    F: Future + Send,
    F::Output: Send,
{
    let runtime = || {
        Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| invalid(format!("exec: failed to start runtime: {}", e)))
    };

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(tokio::task::block_in_place(|| handle.block_on(future)))
        }
        // A current-thread runtime cannot block in place; drive the process
        // from a helper thread with its own runtime.
        Ok(_) => std::thread::scope(|scope| {
            scope
                .spawn(move || runtime().map(|rt| rt.block_on(future)))
                .join()
                .map_err(|_| invalid("exec: process driver panicked"))?
        }),
        Err(_) => Ok(runtime()?.block_on(future)),
    }
}

/// Return a copy of `map` with `value` set at the dotted `path`
///
/// Usage: {{ set_value_at_path("a.b", 1, values) }}
pub fn set_value_at_path(path: String, value: Value, map: Value) -> Result<Value, Error> {
    let mut root = to_json(&map)?;
    let new_value = to_json(&value)?;
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(invalid("set_value_at_path: empty path"));
    };

    let mut current = &mut root;
    for segment in parents {
        current = match current {
            JsonValue::Object(obj) => obj.get_mut(*segment).ok_or_else(|| {
                invalid(format!("set_value_at_path: no value at `{}` in `{}`", segment, path))
            })?,
            other => {
                return Err(invalid(format!(
                    "set_value_at_path: `{}` in `{}` is not a map: {}",
                    segment, path, other
                )));
            }
        };
    }

    match current {
        JsonValue::Object(obj) => {
            obj.insert((*last).to_string(), new_value);
        }
        other => {
            return Err(invalid(format!(
                "set_value_at_path: parent of `{}` is not a map: {}",
                last, other
            )));
        }
    }

    Ok(Value::from_serialize(&root))
}

/// Fail unless the environment variable is set and non-empty
///
/// Usage: {{ required_env("KUBECONFIG") }}
pub fn required_env(name: String) -> Result<String, Error> {
    match std::env::var(&name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(invalid(format!("required env var `{}` is not set", name))),
    }
}

enum Lookup {
    Found(JsonValue),
    Missing(String),
}

/// Dotted lookup over map-shaped values. Every template context record
/// serializes to a map, so maps are the only traversable kind. Missing keys
/// and `null` parents are reported as misses, anything else is a type error.
fn lookup(path: &str, obj: &Value) -> Result<Lookup, Error> {
    let mut current = to_json(obj)?;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            JsonValue::Object(mut map) => match map.remove(segment) {
                Some(next) => next,
                None => return Ok(Lookup::Missing(segment.to_string())),
            },
            JsonValue::Null => return Ok(Lookup::Missing(segment.to_string())),
            other => {
                return Err(invalid(format!(
                    "get: cannot look up `{}` of `{}` in a {}",
                    segment,
                    path,
                    stackfile_core::values::type_name(&other)
                )));
            }
        };
    }
    Ok(Lookup::Found(current))
}

/// `get(path, obj)` or `get(path, default, obj)`
///
/// Usage: {{ get("db.port", 5432, values) }}
pub fn get(path: String, args: Rest<Value>) -> Result<Value, Error> {
    let (default, obj) = match args.as_slice() {
        [obj] => (None, obj),
        [default, obj] => (Some(default), obj),
        _ => return Err(invalid("get: expected get(path, obj) or get(path, default, obj)")),
    };

    match lookup(&path, obj)? {
        Lookup::Found(value) => Ok(Value::from_serialize(&value)),
        Lookup::Missing(segment) => match default {
            Some(default) => Ok(default.clone()),
            None => Err(invalid(format!("get: no value for `{}` at `{}`", segment, path))),
        },
    }
}

/// Like `get` without a default, but a missing key yields `none`
pub fn get_or_nil(path: String, obj: Value) -> Result<Value, Error> {
    match lookup(&path, &obj)? {
        Lookup::Found(value) => Ok(Value::from_serialize(&value)),
        Lookup::Missing(_) => Ok(Value::from(())),
    }
}

/// Render an inline template against arbitrary data
///
/// Usage: {{ tpl(values.banner, {"name": release.name}) }}
pub fn tpl(state: &State, text: String, data: Value) -> Result<String, Error> {
    state.env().render_str(&text, data)
}
