//! Builtin functions of the in-memory engine.

use std::collections::BTreeSet;
use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use bincode::{Decode, Encode};
use rustc_hash::FxHashSet;

use super::interp::{DEFAULT_PACKAGES, Interp, element, truthy};
use super::parser::{Arg, BinaryOp, Expr};
use crate::error::{Error, Result};
use crate::value::{
    EngineValue, INTEGER_NA, LOGICAL_NA, ListEntry, ValueKind, is_na_real, real_na,
};

/// Granularity of interrupt checks while sleeping.
const SLEEP_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// On-disk workspace image written by `save.image` and read by `load`.
#[derive(Debug, Encode, Decode)]
struct WorkspaceImage {
    variables: Vec<(String, EngineValue)>,
}

/// Evaluated call arguments.
struct CallArgs {
    positional: Vec<EngineValue>,
    named: Vec<(String, EngineValue)>,
}

impl CallArgs {
    fn evaluate(interp: &mut Interp<'_>, args: &[Arg]) -> Result<Self> {
        let mut positional = Vec::new();
        let mut named = Vec::new();
        for arg in args {
            let value = interp.eval(&arg.value)?;
            match &arg.name {
                Some(name) => named.push((name.clone(), value)),
                None => positional.push(value),
            }
        }
        Ok(Self { positional, named })
    }

    fn named(&self, name: &str) -> Option<&EngineValue> {
        self.named.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Argument matched by name first, then by position.
    fn get(&self, name: &str, position: usize) -> Option<&EngineValue> {
        self.named(name).or_else(|| self.positional.get(position))
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool> {
        self.named(name).map_or(Ok(default), truthy)
    }

    /// Positional values followed by named ones.
    fn values(&self) -> impl Iterator<Item = &EngineValue> {
        self.positional
            .iter()
            .chain(self.named.iter().map(|(_, v)| v))
    }
}

fn first_string(value: Option<&EngineValue>, what: &str) -> Result<String> {
    value
        .and_then(|v| v.as_strings().into_iter().next().flatten())
        .ok_or_else(|| Error::Engine(format!("invalid '{}' argument", what)))
}

fn scalar_real(value: Option<&EngineValue>, what: &str) -> Result<f64> {
    let real = match value {
        Some(EngineValue::Double(v)) => v.first().copied(),
        Some(EngineValue::Integer(v)) => v
            .first()
            .map(|&i| if i == INTEGER_NA { f64::NAN } else { i as f64 }),
        _ => None,
    };
    real.ok_or_else(|| Error::Engine(format!("invalid '{}' value", what)))
}

/// Call builtin `name`, or `None` if there is no such builtin.
pub(crate) fn call(interp: &mut Interp<'_>, name: &str, args: &[Arg]) -> Option<Result<EngineValue>> {
    let result = match name {
        "c" => CallArgs::evaluate(interp, args).and_then(|a| combine(a.values())),
        "list" => list(interp, args),
        "data.frame" => data_frame(interp, args),
        "factor" => factor(interp, args),
        "class" => unary_value(interp, args, |v| EngineValue::string(v.class_name())),
        "length" => unary_value(interp, args, |v| EngineValue::Integer(vec![v.len() as i32])),
        "is.null" => unary_value(interp, args, |v| EngineValue::logical(v.is_null())),
        "names" => unary_value(interp, args, names),
        "exists" => exists(interp, args),
        "attr" => attr(interp, args),
        "ls" => ls(interp, args),
        "rm" | "remove" => rm(interp, args),
        "print" => print(interp, args),
        "cat" => cat(interp, args),
        "stop" => stop(interp, args),
        "Sys.sleep" => sleep(interp, args),
        "library" => attach(interp, args, false),
        "require" | "requireNamespace" => attach(interp, args, true),
        "detach" => detach(interp, args),
        ".packages" => packages(interp, args),
        "getOption" => get_option(interp, args),
        "setdiff" => setdiff(interp, args),
        "paste0" => paste(interp, args, ""),
        "paste" => paste(interp, args, " "),
        "suppressMessages" | "suppressWarnings" | "invisible" => match args.first() {
            Some(arg) => interp.eval(&arg.value),
            None => Ok(EngineValue::Null),
        },
        "save.image" => save_image(interp, args),
        "load" => load(interp, args),
        "memory.limit" => memory_limit(interp, args),
        _ => return None,
    };
    Some(result)
}

fn unary_value(
    interp: &mut Interp<'_>,
    args: &[Arg],
    f: impl FnOnce(&EngineValue) -> EngineValue,
) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let value = args
        .get("x", 0)
        .ok_or_else(|| Error::Engine("argument \"x\" is missing, with no default".to_string()))?;
    Ok(f(value))
}

/// `c(...)`: concatenate into the most general vector type.
fn combine<'v>(values: impl Iterator<Item = &'v EngineValue>) -> Result<EngineValue> {
    let values: Vec<&EngineValue> = values.filter(|v| !v.is_null()).collect();
    let rank = |v: &EngineValue| match v.kind() {
        ValueKind::Logical => 1,
        ValueKind::Integer => 2,
        ValueKind::Double => 3,
        ValueKind::String | ValueKind::Factor => 4,
        _ => 5,
    };
    let Some(top) = values.iter().map(|&v| rank(v)).max() else {
        return Ok(EngineValue::Null);
    };

    Ok(match top {
        1 => EngineValue::Logical(
            values
                .iter()
                .flat_map(|v| match v {
                    EngineValue::Logical(x) => x.clone(),
                    _ => Vec::new(),
                })
                .collect(),
        ),
        2 => EngineValue::Integer(
            values
                .iter()
                .flat_map(|v| match v {
                    EngineValue::Integer(x) => x.clone(),
                    EngineValue::Logical(x) => x
                        .iter()
                        .map(|&b| if b == LOGICAL_NA { INTEGER_NA } else { b as i32 })
                        .collect(),
                    _ => Vec::new(),
                })
                .collect(),
        ),
        3 => EngineValue::Double(
            values
                .iter()
                .flat_map(|v| match v {
                    EngineValue::Double(x) => x.clone(),
                    EngineValue::Integer(x) => x
                        .iter()
                        .map(|&i| if i == INTEGER_NA { real_na() } else { i as f64 })
                        .collect(),
                    EngineValue::Logical(x) => x
                        .iter()
                        .map(|&b| if b == LOGICAL_NA { real_na() } else { b as f64 })
                        .collect(),
                    _ => Vec::new(),
                })
                .collect(),
        ),
        4 => EngineValue::String(values.iter().flat_map(|v| v.as_strings()).collect()),
        _ => EngineValue::List(
            values
                .iter()
                .flat_map(|v| match v {
                    EngineValue::List(entries) | EngineValue::DataFrame { columns: entries, .. } => {
                        entries.clone()
                    }
                    other => (0..other.len())
                        .map(|i| ListEntry::positional(element(other, i)))
                        .collect(),
                })
                .collect(),
        ),
    })
}

fn list(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let mut entries = Vec::with_capacity(args.len());
    for arg in args {
        let value = interp.eval(&arg.value)?;
        entries.push(ListEntry {
            name: arg.name.clone(),
            value,
        });
    }
    Ok(EngineValue::List(entries))
}

/// Select elements of a vector by index.
fn take(value: &EngineValue, indices: &[usize]) -> EngineValue {
    match value {
        EngineValue::Logical(v) => EngineValue::Logical(indices.iter().map(|&i| v[i]).collect()),
        EngineValue::Integer(v) => EngineValue::Integer(indices.iter().map(|&i| v[i]).collect()),
        EngineValue::Double(v) => EngineValue::Double(indices.iter().map(|&i| v[i]).collect()),
        EngineValue::String(v) => {
            EngineValue::String(indices.iter().map(|&i| v[i].clone()).collect())
        }
        EngineValue::Factor { indices: codes, levels } => EngineValue::Factor {
            indices: indices.iter().map(|&i| codes[i]).collect(),
            levels: levels.clone(),
        },
        EngineValue::List(entries) => {
            EngineValue::List(indices.iter().map(|&i| entries[i].clone()).collect())
        }
        other => other.clone(),
    }
}

fn sorted_factor(strings: Vec<Option<String>>, levels: Option<Vec<String>>) -> EngineValue {
    let levels = levels.unwrap_or_else(|| {
        strings
            .iter()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    });
    let indices = strings
        .iter()
        .map(|s| {
            s.as_ref()
                .and_then(|s| levels.iter().position(|l| l == s))
                .map_or(INTEGER_NA, |p| p as i32 + 1)
        })
        .collect();
    EngineValue::Factor { indices, levels }
}

fn data_frame(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let mut strings_as_factors = false;
    let mut columns: Vec<ListEntry> = Vec::new();

    for (idx, arg) in args.iter().enumerate() {
        let value = interp.eval(&arg.value)?;
        match arg.name.as_deref() {
            Some("stringsAsFactors") => {
                strings_as_factors = truthy(&value)?;
                continue;
            }
            Some("check.names") | Some("row.names") => continue,
            _ => {}
        }
        match value {
            EngineValue::DataFrame { columns: inner, .. } => columns.extend(inner),
            EngineValue::Null => {}
            EngineValue::List(_) => {
                return Err(Error::Engine(
                    "list arguments to data.frame are not supported".to_string(),
                ));
            }
            vector => {
                let name = arg.name.clone().unwrap_or_else(|| format!("V{}", idx + 1));
                columns.push(ListEntry::named(name, vector));
            }
        }
    }

    let rows = columns.iter().map(|c| c.value.len()).max().unwrap_or(0);
    for column in &mut columns {
        let len = column.value.len();
        if len == rows {
            continue;
        }
        if len == 0 || rows % len != 0 {
            return Err(Error::Engine(format!(
                "arguments imply differing number of rows: {}, {}",
                rows, len
            )));
        }
        let indices: Vec<usize> = (0..rows).map(|i| i % len).collect();
        column.value = take(&column.value, &indices);
    }
    if strings_as_factors {
        for column in &mut columns {
            if let EngineValue::String(v) = &column.value {
                column.value = sorted_factor(v.clone(), None);
            }
        }
    }

    let row_names = (1..=rows).map(|i| i.to_string()).collect();
    EngineValue::data_frame(columns, row_names).map_err(|e| Error::Engine(e.to_string()))
}

fn factor(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let strings = args.get("x", 0).map(EngineValue::as_strings).unwrap_or_default();
    let levels = args
        .get("levels", 1)
        .map(|v| v.as_strings().into_iter().flatten().collect());
    Ok(sorted_factor(strings, levels))
}

fn names(value: &EngineValue) -> EngineValue {
    match value {
        EngineValue::List(entries) | EngineValue::DataFrame { columns: entries, .. } => {
            if entries.iter().all(|e| e.name.is_none()) {
                EngineValue::Null
            } else {
                EngineValue::String(
                    entries
                        .iter()
                        .map(|e| Some(e.name.clone().unwrap_or_default()))
                        .collect(),
                )
            }
        }
        _ => EngineValue::Null,
    }
}

fn exists(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let name = first_string(args.get("x", 0), "x")?;
    Ok(EngineValue::logical(interp.ws.vars.contains_key(&name)))
}

fn attr(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let value = args
        .get("x", 0)
        .ok_or_else(|| Error::Engine("argument \"x\" is missing".to_string()))?;
    let which = first_string(args.get("which", 1), "which")?;
    Ok(match (which.as_str(), value) {
        ("row.names", EngineValue::DataFrame { row_names, .. }) => {
            EngineValue::strings(row_names.iter().cloned())
        }
        ("names", v) => names(v),
        ("levels", EngineValue::Factor { levels, .. }) => {
            EngineValue::strings(levels.iter().cloned())
        }
        ("class", EngineValue::Factor { .. } | EngineValue::DataFrame { .. }) => {
            EngineValue::string(value.class_name())
        }
        _ => EngineValue::Null,
    })
}

fn ls(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let all = args.flag("all.names", false)?;
    Ok(EngineValue::strings(
        interp
            .ws
            .vars
            .keys()
            .filter(|k| all || !k.starts_with('.'))
            .cloned(),
    ))
}

fn rm(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let mut targets = Vec::new();
    for arg in args {
        match (arg.name.as_deref(), &arg.value) {
            (Some("list"), expr) => {
                let value = interp.eval(expr)?;
                targets.extend(value.as_strings().into_iter().flatten());
            }
            (Some(_), _) => {}
            (None, Expr::Ident(name)) => targets.push(name.clone()),
            (None, Expr::Literal(EngineValue::String(v))) => {
                targets.extend(v.iter().flatten().cloned());
            }
            (None, other) => {
                return Err(Error::Engine(format!(
                    "... must contain names or character strings, found {:?}",
                    other
                )));
            }
        }
    }
    for name in targets {
        interp.ws.vars.remove(&name);
    }
    Ok(EngineValue::Null)
}

fn print(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let value = args.get("x", 0).cloned().unwrap_or(EngineValue::Null);
    interp.ws.output.push_str(&value.to_string());
    interp.ws.output.push('\n');
    Ok(value)
}

fn cat(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let sep = match args.named("sep") {
        Some(v) => first_string(Some(v), "sep")?,
        None => " ".to_string(),
    };
    let parts: Vec<String> = args
        .positional
        .iter()
        .flat_map(EngineValue::as_strings)
        .map(|s| s.unwrap_or_else(|| "NA".to_string()))
        .collect();
    interp.ws.output.push_str(&parts.join(sep.as_str()));
    Ok(EngineValue::Null)
}

fn stop(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let message: String = args
        .positional
        .iter()
        .flat_map(EngineValue::as_strings)
        .map(|s| s.unwrap_or_else(|| "NA".to_string()))
        .collect();
    Err(Error::Engine(message))
}

fn sleep(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let seconds = scalar_real(args.get("time", 0), "time")?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(Error::Engine("invalid 'time' value".to_string()));
    }
    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    loop {
        interp.checkpoint()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(EngineValue::Null);
        }
        thread::sleep(SLEEP_CHECK_INTERVAL.min(deadline - now));
    }
}

/// Package name of a `library`-style call: a bare symbol, or any string
/// expression when `character.only = TRUE`.
fn package_arg(interp: &mut Interp<'_>, args: &[Arg]) -> Result<String> {
    let mut character_only = false;
    for arg in args {
        if arg.name.as_deref() == Some("character.only") {
            character_only = truthy(&interp.eval(&arg.value)?)?;
        }
    }
    let target = args
        .iter()
        .find(|a| matches!(a.name.as_deref(), None | Some("package") | Some("name")))
        .ok_or_else(|| Error::Engine("argument \"package\" is missing".to_string()))?;

    let name = match &target.value {
        Expr::Ident(name) if !character_only => name.clone(),
        Expr::Binary {
            op: BinaryOp::Range,
            lhs,
            rhs,
        } if !character_only => match (&**lhs, &**rhs) {
            (Expr::Ident(prefix), Expr::Ident(name)) => format!("{}:{}", prefix, name),
            _ => return Err(Error::Engine("invalid package name".to_string())),
        },
        expr => first_string(Some(&interp.eval(expr)?), "package")?,
    };
    Ok(name)
}

fn attach(interp: &mut Interp<'_>, args: &[Arg], soft: bool) -> Result<EngineValue> {
    let package = package_arg(interp, args)?;
    if !interp.ws.installed.contains(&package) {
        if soft {
            interp
                .ws
                .output
                .push_str(&format!("Loading required package: {}\n", package));
            return Ok(EngineValue::logical(false));
        }
        return Err(Error::Engine(format!("there is no package called '{}'", package)));
    }
    if !interp.ws.attached.contains(&package) {
        interp.ws.attached.insert(0, package);
    }
    if soft {
        Ok(EngineValue::logical(true))
    } else {
        Ok(EngineValue::strings(interp.ws.attached.iter().cloned()))
    }
}

fn detach(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let name = package_arg(interp, args)?;
    let package = name.strip_prefix("package:").unwrap_or(&name).to_string();
    if package == "base" {
        return Err(Error::Engine("detaching \"package:base\" is not allowed".to_string()));
    }
    let position = interp
        .ws
        .attached
        .iter()
        .position(|p| *p == package)
        .ok_or_else(|| Error::Engine("invalid 'name' argument".to_string()))?;
    interp.ws.attached.remove(position);
    Ok(EngineValue::Null)
}

fn packages(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    if args.flag("all.available", false)? {
        return Ok(EngineValue::strings(interp.ws.installed.iter().cloned()));
    }
    Ok(EngineValue::strings(interp.ws.attached.iter().cloned()))
}

fn get_option(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let name = first_string(args.get("x", 0), "x")?;
    Ok(match name.as_str() {
        "defaultPackages" => EngineValue::strings(DEFAULT_PACKAGES),
        _ => args.get("default", 1).cloned().unwrap_or(EngineValue::Null),
    })
}

fn setdiff(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let x = args.get("x", 0).map(EngineValue::as_strings).unwrap_or_default();
    let y: FxHashSet<Option<String>> = args
        .get("y", 1)
        .map(EngineValue::as_strings)
        .unwrap_or_default()
        .into_iter()
        .collect();
    let mut seen = FxHashSet::default();
    let result = x
        .into_iter()
        .filter(|s| !y.contains(s) && seen.insert(s.clone()))
        .collect();
    Ok(EngineValue::String(result))
}

fn paste(interp: &mut Interp<'_>, args: &[Arg], default_sep: &str) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let sep = match args.named("sep") {
        Some(v) => first_string(Some(v), "sep")?,
        None => default_sep.to_string(),
    };
    let collapse = args.named("collapse").filter(|v| !v.is_null());

    let pieces: Vec<Vec<String>> = args
        .positional
        .iter()
        .map(|v| {
            v.as_strings()
                .into_iter()
                .map(|s| s.unwrap_or_else(|| "NA".to_string()))
                .collect::<Vec<_>>()
        })
        .filter(|p| !p.is_empty())
        .collect();
    let n = pieces.iter().map(Vec::len).max().unwrap_or(0);
    let joined: Vec<String> = (0..n)
        .map(|i| {
            pieces
                .iter()
                .map(|p| p[i % p.len()].as_str())
                .collect::<Vec<_>>()
                .join(sep.as_str())
        })
        .collect();

    match collapse {
        Some(c) => {
            let c = first_string(Some(c), "collapse")?;
            Ok(EngineValue::string(joined.join(c.as_str())))
        }
        None => Ok(EngineValue::strings(joined)),
    }
}

fn save_image(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let path = match args.get("file", 0) {
        Some(v) => first_string(Some(v), "file")?,
        None => ".RData".to_string(),
    };
    let image = WorkspaceImage {
        variables: interp
            .ws
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    let bytes = bincode::encode_to_vec(&image, bincode::config::standard())
        .map_err(|e| Error::Engine(format!("cannot serialize workspace: {}", e)))?;
    fs::write(&path, bytes)
        .map_err(|e| Error::Engine(format!("cannot open file '{}': {}", path, e)))?;
    Ok(EngineValue::Null)
}

fn load(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    let path = first_string(args.get("file", 0), "file")?;
    let bytes =
        fs::read(&path).map_err(|e| Error::Engine(format!("cannot open file '{}': {}", path, e)))?;
    let (image, _): (WorkspaceImage, usize) =
        bincode::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| Error::Engine(format!("bad restore file magic number in '{}': {}", path, e)))?;

    let mut loaded = Vec::with_capacity(image.variables.len());
    for (name, value) in image.variables {
        loaded.push(name.clone());
        interp.ws.vars.insert(name, value);
    }
    Ok(EngineValue::strings(loaded))
}

fn memory_limit(interp: &mut Interp<'_>, args: &[Arg]) -> Result<EngineValue> {
    let args = CallArgs::evaluate(interp, args)?;
    if let Some(size) = args.get("size", 0) {
        let size = scalar_real(Some(size), "size")?;
        if !is_na_real(size) {
            if size <= 0.0 {
                return Err(Error::Engine("invalid 'size' value".to_string()));
            }
            interp.ws.memory_limit = Some(size);
        }
    }
    Ok(EngineValue::Double(vec![
        interp.ws.memory_limit.unwrap_or(f64::INFINITY),
    ]))
}
