//! Functions available to every template without registration.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use super::{ClosureFunc, FuncRef};
use crate::ast::value::Value;
use crate::error::FuncError;

type Builtin = fn(Vec<Value>) -> Result<Value, FuncError>;

static BUILTINS: LazyLock<HashMap<&'static str, FuncRef>> = LazyLock::new(|| {
    let table: [(&'static str, Builtin); 15] = [
        ("and", and),
        ("or", or),
        ("not", not),
        ("len", len),
        ("index", index),
        ("slice", slice),
        ("eq", eq),
        ("ne", ne),
        ("lt", lt),
        ("le", le),
        ("gt", gt),
        ("ge", ge),
        ("print", print),
        ("println", println),
        ("printf", printf),
    ];
    table
        .into_iter()
        .map(|(name, func)| (name, Arc::new(ClosureFunc::new(func)) as FuncRef))
        .collect()
});

pub(crate) fn get(name: &str) -> Option<FuncRef> {
    BUILTINS.get(name).cloned()
}

pub(crate) fn contains(name: &str) -> bool {
    BUILTINS.contains_key(name)
}

// ── Logic ───────────────────────────────────────────────────────────────

/// First falsy argument, or the last one.
fn and(args: Vec<Value>) -> Result<Value, FuncError> {
    let got = args.len();
    let mut last = None;
    for arg in args {
        if !arg.is_truthy() {
            return Ok(arg);
        }
        last = Some(arg);
    }
    last.ok_or_else(|| FuncError::at_least(1, got))
}

/// First truthy argument, or the last one.
fn or(args: Vec<Value>) -> Result<Value, FuncError> {
    let got = args.len();
    let mut last = None;
    for arg in args {
        if arg.is_truthy() {
            return Ok(arg);
        }
        last = Some(arg);
    }
    last.ok_or_else(|| FuncError::at_least(1, got))
}

fn not(args: Vec<Value>) -> Result<Value, FuncError> {
    let [arg] = exactly::<1>(args)?;
    Ok(Value::Bool(!arg.is_truthy()))
}

// ── Collections ─────────────────────────────────────────────────────────

fn len(args: Vec<Value>) -> Result<Value, FuncError> {
    let [arg] = exactly::<1>(args)?;
    let n = match &arg {
        Value::String(s) => s.len(),
        Value::Array(items) => items.len(),
        Value::Map(entries) => entries.len(),
        other => return Err(FuncError::failed(format!("len of type {}", other.type_name()))),
    };
    Ok(Value::from(n))
}

/// `index item 1 "key" ...` walks arrays by integer and maps by string.
/// A missing map key yields nil.
fn index(args: Vec<Value>) -> Result<Value, FuncError> {
    let mut args = args.into_iter();
    let mut item = args.next().ok_or_else(|| FuncError::at_least(1, 0))?;

    for key in args {
        item = match (item, key) {
            (Value::Array(mut items), Value::Int(i)) => {
                let len = items.len();
                let idx = usize::try_from(i)
                    .ok()
                    .filter(|&idx| idx < len)
                    .ok_or_else(|| FuncError::failed(format!("index out of range: {i}")))?;
                items.swap_remove(idx)
            }
            (Value::Map(mut entries), Value::String(k)) => entries.remove(&*k).unwrap_or_default(),
            (Value::Null, _) => return Err(FuncError::failed("index of untyped nil")),
            (Value::Array(_), other) => {
                return Err(FuncError::Type {
                    expected: "int index",
                    got: other.type_name(),
                });
            }
            (Value::Map(_), other) => {
                return Err(FuncError::Type {
                    expected: "string key",
                    got: other.type_name(),
                });
            }
            (other, _) => {
                return Err(FuncError::failed(format!("can't index item of type {}", other.type_name())));
            }
        };
    }
    Ok(item)
}

/// `slice x 1 2` is `x[1:2]` for strings and arrays.
fn slice(args: Vec<Value>) -> Result<Value, FuncError> {
    let got = args.len();
    if !(1..=3).contains(&got) {
        return Err(FuncError::WrongArgCount {
            expected: "1 to 3".to_string(),
            got,
        });
    }
    let mut args = args.into_iter();
    let item = args.next().unwrap_or_default();
    let bounds = args
        .map(|arg| match arg {
            Value::Int(n) => usize::try_from(n)
                .map_err(|_| FuncError::failed(format!("negative slice index: {n}"))),
            other => Err(FuncError::Type {
                expected: "int",
                got: other.type_name(),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let slice_range = |len: usize| -> Result<(usize, usize), FuncError> {
        let start = bounds.first().copied().unwrap_or(0);
        let end = bounds.get(1).copied().unwrap_or(len);
        if start > end || end > len {
            return Err(FuncError::failed(format!("slice index out of range: [{start}:{end}] with length {len}")));
        }
        Ok((start, end))
    };

    match item {
        Value::String(s) => {
            let (start, end) = slice_range(s.len())?;
            s.get(start..end)
                .map(Value::from)
                .ok_or_else(|| FuncError::failed("slice splits a UTF-8 character"))
        }
        Value::Array(items) => {
            let (start, end) = slice_range(items.len())?;
            Ok(Value::Array(items[start..end].to_vec()))
        }
        other => Err(FuncError::failed(format!("can't slice item of type {}", other.type_name()))),
    }
}

// ── Comparison ──────────────────────────────────────────────────────────

fn compare(a: &Value, b: &Value) -> Result<Ordering, FuncError> {
    let incompatible = || {
        FuncError::failed(format!(
            "incompatible types for comparison: {} and {}",
            a.type_name(),
            b.type_name()
        ))
    };
    match (a, b) {
        (Value::Int(_) | Value::UInt(_), Value::Int(_) | Value::UInt(_)) => {
            Ok(integer(a).cmp(&integer(b)))
        }
        (Value::Int(_) | Value::UInt(_) | Value::Float(_), Value::Int(_) | Value::UInt(_) | Value::Float(_)) => {
            let (x, y) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
            x.partial_cmp(&y).ok_or_else(incompatible)
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(incompatible()),
    }
}

/// Exact value of an integer operand.
fn integer(v: &Value) -> i128 {
    match v {
        Value::Int(n) => (*n).into(),
        Value::UInt(n) => (*n).into(),
        _ => 0,
    }
}

fn equal(a: &Value, b: &Value) -> Result<bool, FuncError> {
    match (a, b) {
        (Value::Null, Value::Null) => Ok(true),
        (Value::Null, _) | (_, Value::Null) => Ok(false),
        (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
        (Value::Array(_) | Value::Map(_), _) | (_, Value::Array(_) | Value::Map(_)) => Err(
            FuncError::failed(format!("non-comparable type {}", a.type_name())),
        ),
        _ => compare(a, b).map(Ordering::is_eq),
    }
}

/// `eq a b c` is `a == b || a == c`.
fn eq(args: Vec<Value>) -> Result<Value, FuncError> {
    let Some((first, rest)) = args.split_first().filter(|(_, rest)| !rest.is_empty()) else {
        return Err(FuncError::at_least(2, args.len()));
    };
    for other in rest {
        if equal(first, other)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn ne(args: Vec<Value>) -> Result<Value, FuncError> {
    let [a, b] = exactly::<2>(args)?;
    Ok(Value::Bool(!equal(&a, &b)?))
}

fn ordered(args: Vec<Value>, accept: fn(Ordering) -> bool) -> Result<Value, FuncError> {
    let [a, b] = exactly::<2>(args)?;
    Ok(Value::Bool(accept(compare(&a, &b)?)))
}

fn lt(args: Vec<Value>) -> Result<Value, FuncError> {
    ordered(args, Ordering::is_lt)
}

fn le(args: Vec<Value>) -> Result<Value, FuncError> {
    ordered(args, Ordering::is_le)
}

fn gt(args: Vec<Value>) -> Result<Value, FuncError> {
    ordered(args, Ordering::is_gt)
}

fn ge(args: Vec<Value>) -> Result<Value, FuncError> {
    ordered(args, Ordering::is_ge)
}

// ── Printing ────────────────────────────────────────────────────────────

/// Operands are separated by a space when neither side is a string.
fn print(args: Vec<Value>) -> Result<Value, FuncError> {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 && !matches!(arg, Value::String(_)) && !matches!(args[i - 1], Value::String(_)) {
            out.push(' ');
        }
        out.push_str(&arg.to_string());
    }
    Ok(Value::from(out))
}

fn println(args: Vec<Value>) -> Result<Value, FuncError> {
    let mut out = args.iter().map(Value::to_string).collect::<Vec<_>>().join(" ");
    out.push('\n');
    Ok(Value::from(out))
}

/// Go-style formatting with the verbs `%v %s %d %f %q %t %%`, optional
/// `-`/`0` flags, width and precision.
fn printf(args: Vec<Value>) -> Result<Value, FuncError> {
    let mut args = args.into_iter();
    let format = match args.next() {
        Some(Value::String(s)) => s,
        Some(other) => {
            return Err(FuncError::Type {
                expected: "format string",
                got: other.type_name(),
            });
        }
        None => return Err(FuncError::at_least(1, 0)),
    };

    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }

        let mut spec = Spec::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.left = true,
                '0' => spec.zero = true,
                _ => break,
            }
            chars.next();
        }
        spec.width = take_number(&mut chars)?;
        if chars.peek() == Some(&'.') {
            chars.next();
            spec.precision = Some(take_number(&mut chars)?.unwrap_or(0));
        }

        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let Some(arg) = args.next() else {
            out.push_str(&format!("%!{verb}(MISSING)"));
            continue;
        };
        let text = format_verb(verb, &arg, spec.precision)?;
        spec.pad(&mut out, &text, matches!(arg, Value::Int(_) | Value::UInt(_) | Value::Float(_)));
    }

    let extra: Vec<_> = args.map(|arg| format!("{}={arg}", arg.type_name())).collect();
    if !extra.is_empty() {
        out.push_str(&format!("%!(EXTRA {})", extra.join(", ")));
    }
    Ok(Value::from(out))
}

#[derive(Default)]
struct Spec {
    left: bool,
    zero: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

impl Spec {
    fn pad(&self, out: &mut String, text: &str, numeric: bool) {
        let width = self.width.unwrap_or(0);
        let fill = width.saturating_sub(text.chars().count());
        if fill == 0 {
            out.push_str(text);
        } else if self.left {
            out.push_str(text);
            out.extend(std::iter::repeat_n(' ', fill));
        } else if self.zero && numeric {
            let (sign, digits) = match text.strip_prefix('-') {
                Some(rest) => ("-", rest),
                None => ("", text),
            };
            out.push_str(sign);
            out.extend(std::iter::repeat_n('0', fill));
            out.push_str(digits);
        } else {
            out.extend(std::iter::repeat_n(' ', fill));
            out.push_str(text);
        }
    }
}

/// Largest width or precision `printf` accepts.
const MAX_FORMAT_NUMBER: usize = u16::MAX as usize;

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<Option<usize>, FuncError> {
    let mut n: Option<usize> = None;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        let next = n
            .unwrap_or(0)
            .checked_mul(10)
            .and_then(|n| n.checked_add(d as usize))
            .filter(|&n| n <= MAX_FORMAT_NUMBER)
            .ok_or_else(|| FuncError::failed("printf width/precision out of range"))?;
        n = Some(next);
        chars.next();
    }
    Ok(n)
}

fn format_verb(verb: char, arg: &Value, precision: Option<usize>) -> Result<String, FuncError> {
    let text = match (verb, arg) {
        ('v' | 's', Value::Float(f)) if precision.is_some() => {
            format!("{f:.prec$}", prec = precision.unwrap_or(0))
        }
        ('v', _) => arg.to_string(),
        ('s', _) => match precision {
            Some(prec) => arg.to_string().chars().take(prec).collect(),
            None => arg.to_string(),
        },
        ('d', Value::Int(n)) => n.to_string(),
        ('d', Value::UInt(n)) => n.to_string(),
        ('f', _) => {
            let f = arg.as_f64().ok_or(FuncError::Type {
                expected: "number",
                got: arg.type_name(),
            })?;
            format!("{f:.prec$}", prec = precision.unwrap_or(6))
        }
        ('q', Value::String(s)) => format!("{:?}", &**s),
        ('q', other) => format!("{:?}", other.to_string()),
        ('t', Value::Bool(b)) => b.to_string(),
        ('d' | 't', other) => format!("%!{verb}({}={other})", other.type_name()),
        (other, _) => format!("%!{other}(BADVERB)"),
    };
    Ok(text)
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn exactly<const N: usize>(args: Vec<Value>) -> Result<[Value; N], FuncError> {
    let got = args.len();
    args.try_into().map_err(|_| FuncError::arity(N, got))
}
