//! String builtin methods (handler ids 30-56).

use super::intrinsics::{int_arg, str_arg};
use super::VmError;
use crate::values::Value;

pub(super) const METHODS: &[(&str, u8)] = &[
    ("len", 30),
    ("length", 31),
    ("split", 32),
    ("trim", 33),
    ("trim_start", 34),
    ("trim_end", 35),
    ("to_upper", 36),
    ("to_lower", 37),
    ("starts_with", 38),
    ("ends_with", 39),
    ("replace", 40),
    ("contains", 41),
    ("chars", 42),
    ("bytes", 43),
    ("reverse", 44),
    ("repeat", 45),
    ("pad_left", 46),
    ("pad_right", 47),
    ("count", 48),
    ("is_empty", 49),
    ("index_of", 50),
    ("substring", 51),
    ("capitalize", 52),
    ("title_case", 53),
    ("snake_case", 54),
    ("camel_case", 55),
    ("kebab_case", 56),
];

fn strings(parts: impl IntoIterator<Item = String>) -> Value {
    Value::array(parts.into_iter().map(Value::string).collect())
}

/// Split into lowercase words at separators and lower-to-upper case
/// boundaries.
fn words(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in s.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn pad(s: &str, args: &[Value], method: &str, left: bool) -> Result<Value, VmError> {
    let width = usize::try_from(int_arg(args, 0, method)?).unwrap_or(0);
    let fill = match args.get(1) {
        Some(_) => str_arg(args, 1, method)?.chars().next().unwrap_or(' '),
        None => ' ',
    };
    let len = s.chars().count();
    if len >= width {
        return Ok(Value::string(s));
    }
    let padding: String = std::iter::repeat(fill).take(width - len).collect();
    Ok(Value::string(if left {
        padding + s
    } else {
        s.to_string() + &padding
    }))
}

pub(super) fn string_method(id: u8, s: &str, args: &[Value]) -> Result<Value, VmError> {
    Ok(match id {
        30 | 31 => Value::int(s.chars().count() as i64),
        32 => {
            let sep = match args.first() {
                Some(_) => str_arg(args, 0, "split")?,
                None => " ",
            };
            if sep.is_empty() {
                strings(s.chars().map(String::from))
            } else {
                strings(s.split(sep).map(String::from))
            }
        }
        33 => Value::string(s.trim()),
        34 => Value::string(s.trim_start()),
        35 => Value::string(s.trim_end()),
        36 => Value::string(s.to_uppercase()),
        37 => Value::string(s.to_lowercase()),
        38 => Value::bool(s.starts_with(str_arg(args, 0, "starts_with")?)),
        39 => Value::bool(s.ends_with(str_arg(args, 0, "ends_with")?)),
        40 => {
            let from = str_arg(args, 0, "replace")?;
            let to = str_arg(args, 1, "replace")?;
            Value::string(s.replace(from, to))
        }
        41 => Value::bool(s.contains(str_arg(args, 0, "contains")?)),
        42 => strings(s.chars().map(String::from)),
        43 => Value::array(s.bytes().map(|b| Value::int(b as i64)).collect()),
        44 => Value::string(s.chars().rev().collect::<String>()),
        45 => {
            let n = int_arg(args, 0, "repeat")?;
            let n = usize::try_from(n)
                .map_err(|_| VmError::Runtime("repeat() count must be >= 0".into()))?;
            Value::string(s.repeat(n))
        }
        46 => return pad(s, args, "pad_left", true),
        47 => return pad(s, args, "pad_right", false),
        48 => {
            let needle = str_arg(args, 0, "count")?;
            let n = if needle.is_empty() { 0 } else { s.matches(needle).count() };
            Value::int(n as i64)
        }
        49 => Value::bool(s.is_empty()),
        50 => {
            let needle = str_arg(args, 0, "index_of")?;
            match s.find(needle) {
                Some(byte) => Value::int(s[..byte].chars().count() as i64),
                None => Value::int(-1),
            }
        }
        51 => {
            let len = s.chars().count() as i64;
            let start = int_arg(args, 0, "substring")?.clamp(0, len);
            let end = match args.get(1) {
                Some(_) => int_arg(args, 1, "substring")?.clamp(start, len),
                None => len,
            };
            Value::string(
                s.chars()
                    .skip(start as usize)
                    .take((end - start) as usize)
                    .collect::<String>(),
            )
        }
        52 => Value::string(capitalize(s)),
        53 => Value::string(
            s.split(' ')
                .map(|w| capitalize(&w.to_lowercase()))
                .collect::<Vec<_>>()
                .join(" "),
        ),
        54 => Value::string(words(s).join("_")),
        55 => {
            let words = words(s);
            let mut out = String::new();
            for (i, w) in words.iter().enumerate() {
                if i == 0 {
                    out.push_str(w);
                } else {
                    out.push_str(&capitalize(w));
                }
            }
            Value::string(out)
        }
        56 => Value::string(words(s).join("-")),
        _ => return Err(VmError::Runtime(format!("unknown string builtin {id}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, s: &str, args: &[Value]) -> Value {
        let id = METHODS.iter().find(|(n, _)| *n == name).unwrap().1;
        string_method(id, s, args).unwrap()
    }

    #[test]
    fn case_conversions() {
        assert_eq!(call("snake_case", "helloWorld Foo", &[]), Value::string("hello_world_foo"));
        assert_eq!(call("camel_case", "hello_world", &[]), Value::string("helloWorld"));
        assert_eq!(call("kebab_case", "Hello World", &[]), Value::string("hello-world"));
        assert_eq!(call("title_case", "hello wORLD", &[]), Value::string("Hello World"));
        assert_eq!(call("capitalize", "éclair", &[]), Value::string("Éclair"));
    }

    #[test]
    fn char_based_indexing() {
        assert_eq!(call("len", "héllo", &[]), Value::int(5));
        assert_eq!(call("index_of", "héllo", &[Value::string("l")]), Value::int(2));
        assert_eq!(
            call("substring", "héllo", &[Value::int(1), Value::int(3)]),
            Value::string("él")
        );
        assert_eq!(call("index_of", "abc", &[Value::string("z")]), Value::int(-1));
    }

    #[test]
    fn padding_and_split() {
        assert_eq!(
            call("pad_left", "7", &[Value::int(3), Value::string("0")]),
            Value::string("007")
        );
        assert_eq!(call("pad_right", "ab", &[Value::int(1)]), Value::string("ab"));
        assert_eq!(
            call("split", "a,b", &[Value::string(",")]),
            Value::array(vec![Value::string("a"), Value::string("b")])
        );
    }

    #[test]
    fn missing_argument_is_an_error() {
        assert!(string_method(38, "abc", &[]).is_err());
    }
}
