use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use datalog_syntax::{Literal, Tablename, TypedValue};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use std::cmp::Ordering;
use thiserror::Error;

const BUILTIN_SERVICE: &str = "builtin";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuiltinError {
    #[error("{builtin} cannot be applied to {arguments}")]
    Type { builtin: &'static str, arguments: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow in {0}")]
    Overflow(&'static str),
    #[error("cannot convert {0}")]
    Conversion(String),
    #[error("cannot interpret {0} as a datetime")]
    Datetime(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuiltinOutput {
    Truth(bool),
    Values(Vec<TypedValue>),
}

type Code = fn(&'static str, &[TypedValue]) -> Result<BuiltinOutput, BuiltinError>;

pub struct Builtin {
    pub name: &'static str,
    pub category: &'static str,
    pub arguments: &'static [&'static str],
    pub num_inputs: usize,
    code: Code,
}

impl Builtin {
    pub fn arity(&self) -> usize {
        self.arguments.len()
    }
    pub fn num_outputs(&self) -> usize {
        self.arity() - self.num_inputs
    }
    pub fn call(&self, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
        (self.code)(self.name, inputs)
    }
}

pub struct BuiltinRegistry {
    builtins: IndexMap<&'static str, Builtin>,
}

static BUILTINS: Lazy<BuiltinRegistry> = Lazy::new(BuiltinRegistry::standard);

pub fn registry() -> &'static BuiltinRegistry {
    &BUILTINS
}

/// The builtin a literal invokes, if any.
pub fn builtin_for(literal: &Literal) -> Option<&'static Builtin> {
    registry().lookup(&literal.table, literal.arity())
}

pub fn is_builtin(literal: &Literal) -> bool {
    builtin_for(literal).is_some()
}

impl BuiltinRegistry {
    fn standard() -> Self {
        let mut registry = BuiltinRegistry {
            builtins: IndexMap::new(),
        };
        let mut add = |name, category, arguments, num_inputs, code| {
            registry.builtins.insert(
                name,
                Builtin {
                    name,
                    category,
                    arguments,
                    num_inputs,
                    code,
                },
            );
        };

        add("lt", "comparison", &["x", "y"], 2, compare);
        add("lteq", "comparison", &["x", "y"], 2, compare);
        add("equal", "comparison", &["x", "y"], 2, compare);
        add("gt", "comparison", &["x", "y"], 2, compare);
        add("gteq", "comparison", &["x", "y"], 2, compare);
        add("max", "comparison", &["x", "y", "z"], 2, maximum);
        add("plus", "arithmetic", &["x", "y", "z"], 2, arithmetic);
        add("minus", "arithmetic", &["x", "y", "z"], 2, arithmetic);
        add("mul", "arithmetic", &["x", "y", "z"], 2, arithmetic);
        add("div", "arithmetic", &["x", "y", "z"], 2, arithmetic);
        add("float", "arithmetic", &["x", "y"], 1, to_float);
        add("int", "arithmetic", &["x", "y"], 1, to_int);
        add("concat", "string", &["x", "y", "z"], 2, concat);
        add("len", "string", &["x", "y"], 1, length);
        add("now", "datetime", &["x"], 0, now);
        add("unpack_date", "datetime", &["x", "year", "month", "day"], 1, unpack);
        add("unpack_time", "datetime", &["x", "hours", "minutes", "seconds"], 1, unpack);
        add("unpack_datetime", "datetime", &["x", "y", "m", "d", "h", "i", "s"], 1, unpack);
        add("pack_time", "datetime", &["hours", "minutes", "seconds", "result"], 3, pack);
        add("pack_date", "datetime", &["year", "month", "day", "result"], 3, pack);
        add("pack_datetime", "datetime", &["y", "m", "d", "h", "i", "s", "result"], 6, pack);
        add("extract_date", "datetime", &["x", "y"], 1, extract);
        add("extract_time", "datetime", &["x", "y"], 1, extract);
        add("datetime_to_seconds", "datetime", &["x", "y"], 1, to_seconds);
        add("datetime_plus", "datetime", &["x", "y", "z"], 2, shift_datetime);
        add("datetime_minus", "datetime", &["x", "y", "z"], 2, shift_datetime);
        add("datetime_lt", "datetime", &["x", "y"], 2, compare_datetimes);
        add("datetime_lteq", "datetime", &["x", "y"], 2, compare_datetimes);
        add("datetime_gt", "datetime", &["x", "y"], 2, compare_datetimes);
        add("datetime_gteq", "datetime", &["x", "y"], 2, compare_datetimes);
        add("datetime_equal", "datetime", &["x", "y"], 2, compare_datetimes);

        registry
    }
    pub fn get(&self, name: &str) -> Option<&Builtin> {
        self.builtins.get(name)
    }
    pub fn lookup(&self, table: &Tablename, arity: usize) -> Option<&Builtin> {
        if table.modal.is_some() {
            return None;
        }
        if !matches!(table.service.as_deref(), None | Some(BUILTIN_SERVICE)) {
            return None;
        }

        self.builtins
            .get(table.table.as_str())
            .filter(|builtin| builtin.arity() == arity)
    }
    pub fn is_reserved(&self, table: &str) -> bool {
        self.builtins.contains_key(table)
    }
    pub fn categories(&self) -> Vec<&'static str> {
        let mut categories: Vec<_> = self.builtins.values().map(|builtin| builtin.category).collect();
        categories.dedup();
        categories
    }
    pub fn iter(&self) -> impl Iterator<Item = &Builtin> {
        self.builtins.values()
    }
}

fn type_error(builtin: &'static str, inputs: &[TypedValue]) -> BuiltinError {
    let arguments: Vec<String> = inputs.iter().map(|value| value.to_string()).collect();

    BuiltinError::Type {
        builtin,
        arguments: arguments.join(", "),
    }
}

fn raw(value: &TypedValue) -> String {
    match value {
        TypedValue::Str(inner) => inner.clone(),
        TypedValue::Int(inner) => inner.to_string(),
        TypedValue::Float(inner) => inner.to_string(),
    }
}

fn order(builtin: &'static str, inputs: &[TypedValue]) -> Result<Ordering, BuiltinError> {
    match (&inputs[0], &inputs[1]) {
        (TypedValue::Str(x), TypedValue::Str(y)) => Ok(x.cmp(y)),
        (TypedValue::Int(x), TypedValue::Int(y)) => Ok(x.cmp(y)),
        (x, y) => match (x.as_float(), y.as_float()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).ok_or_else(|| type_error(builtin, inputs)),
            _ => Err(type_error(builtin, inputs)),
        },
    }
}

fn truth_of(builtin: &'static str, ordering: Ordering) -> bool {
    match builtin.trim_start_matches("datetime_") {
        "lt" => ordering == Ordering::Less,
        "lteq" => ordering != Ordering::Greater,
        "gt" => ordering == Ordering::Greater,
        "gteq" => ordering != Ordering::Less,
        _ => ordering == Ordering::Equal,
    }
}

fn compare(builtin: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    Ok(BuiltinOutput::Truth(truth_of(builtin, order(builtin, inputs)?)))
}

fn maximum(builtin: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    let larger = match order(builtin, inputs)? {
        Ordering::Less => inputs[1].clone(),
        _ => inputs[0].clone(),
    };

    Ok(BuiltinOutput::Values(vec![larger]))
}

fn floor_div(x: i64, y: i64) -> Option<i64> {
    let quotient = x.checked_div(y)?;
    if x % y != 0 && ((x < 0) != (y < 0)) {
        return quotient.checked_sub(1);
    }

    Some(quotient)
}

fn arithmetic(builtin: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    let value = match (&inputs[0], &inputs[1]) {
        (TypedValue::Int(x), TypedValue::Int(y)) => {
            let result = match builtin {
                "plus" => x.checked_add(*y),
                "minus" => x.checked_sub(*y),
                "mul" => x.checked_mul(*y),
                _ if *y == 0 => return Err(BuiltinError::DivisionByZero),
                _ => floor_div(*x, *y),
            };
            TypedValue::Int(result.ok_or(BuiltinError::Overflow(builtin))?)
        }
        (TypedValue::Str(x), TypedValue::Str(y)) if builtin == "plus" => TypedValue::Str(format!("{}{}", x, y)),
        (x, y) => {
            let (Some(x), Some(y)) = (x.as_float(), y.as_float()) else {
                return Err(type_error(builtin, inputs));
            };
            let result = match builtin {
                "plus" => x + y,
                "minus" => x - y,
                "mul" => x * y,
                _ if y == 0.0 => return Err(BuiltinError::DivisionByZero),
                _ => x / y,
            };
            TypedValue::Float(result)
        }
    };

    Ok(BuiltinOutput::Values(vec![value]))
}

fn to_float(_: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    let value = match &inputs[0] {
        TypedValue::Str(inner) => inner
            .trim()
            .parse::<f64>()
            .map_err(|_| BuiltinError::Conversion(inner.clone()))?,
        number => number.as_float().ok_or_else(|| BuiltinError::Conversion(number.to_string()))?,
    };

    Ok(BuiltinOutput::Values(vec![TypedValue::Float(value)]))
}

fn to_int(_: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    let value = match &inputs[0] {
        TypedValue::Int(inner) => *inner,
        TypedValue::Float(inner) if inner.is_finite() => inner.trunc() as i64,
        TypedValue::Str(inner) => inner
            .trim()
            .parse::<i64>()
            .map_err(|_| BuiltinError::Conversion(inner.clone()))?,
        other => return Err(BuiltinError::Conversion(other.to_string())),
    };

    Ok(BuiltinOutput::Values(vec![TypedValue::Int(value)]))
}

fn concat(builtin: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    match (&inputs[0], &inputs[1]) {
        (TypedValue::Str(x), TypedValue::Str(y)) => Ok(BuiltinOutput::Values(vec![TypedValue::Str(format!("{}{}", x, y))])),
        _ => Err(type_error(builtin, inputs)),
    }
}

fn length(builtin: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    match &inputs[0] {
        TypedValue::Str(x) => Ok(BuiltinOutput::Values(vec![TypedValue::Int(x.chars().count() as i64)])),
        _ => Err(type_error(builtin, inputs)),
    }
}

fn parse_datetime(value: &TypedValue) -> Result<NaiveDateTime, BuiltinError> {
    let text = raw(value);
    let text = text.trim();
    for format in [DATETIME_FORMAT, "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(datetime);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }
    if let Ok(time) = NaiveTime::parse_from_str(text, "%H:%M:%S") {
        return Ok(Local::now().date_naive().and_time(time));
    }

    Err(BuiltinError::Datetime(text.to_string()))
}

/// `"d:h:m:s"`-style strings read right to left, numbers are seconds.
fn parse_timedelta(value: &TypedValue) -> Result<TimeDelta, BuiltinError> {
    const UNITS: [i64; 5] = [1, 60, 3_600, 86_400, 604_800];
    let overflow = || BuiltinError::Conversion(value.to_string());
    let seconds = match value {
        TypedValue::Int(seconds) => *seconds,
        TypedValue::Float(seconds) if seconds.is_finite() && seconds.abs() < i64::MAX as f64 => {
            seconds.trunc() as i64
        }
        TypedValue::Float(_) => return Err(overflow()),
        TypedValue::Str(text) => {
            let fields: Vec<&str> = text.split(':').collect();
            if fields.len() > UNITS.len() {
                return Err(BuiltinError::Conversion(text.clone()));
            }
            let mut seconds = 0i64;
            for (field, unit) in fields.iter().rev().zip(UNITS.iter()) {
                let amount: i64 = field
                    .trim()
                    .parse()
                    .map_err(|_| BuiltinError::Conversion(text.clone()))?;
                seconds = amount
                    .checked_mul(*unit)
                    .and_then(|amount| seconds.checked_add(amount))
                    .ok_or_else(overflow)?;
            }
            seconds
        }
    };

    TimeDelta::try_seconds(seconds).ok_or_else(overflow)
}

fn now(_: &'static str, _: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    let now = Local::now().naive_local().format(DATETIME_FORMAT).to_string();

    Ok(BuiltinOutput::Values(vec![TypedValue::Str(now)]))
}

fn unpack(builtin: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    let datetime = parse_datetime(&inputs[0])?;
    let date = [datetime.year() as i64, datetime.month() as i64, datetime.day() as i64];
    let time = [datetime.hour() as i64, datetime.minute() as i64, datetime.second() as i64];
    let fields: Vec<i64> = match builtin {
        "unpack_date" => date.to_vec(),
        "unpack_time" => time.to_vec(),
        _ => date.iter().chain(time.iter()).copied().collect(),
    };

    Ok(BuiltinOutput::Values(fields.into_iter().map(TypedValue::Int).collect()))
}

fn pack(builtin: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    let parts: Vec<String> = inputs.iter().map(raw).collect();
    let packed = match builtin {
        "pack_time" => parts.join(":"),
        "pack_date" => parts.join("-"),
        _ => format!("{} {}", parts[..3].join("-"), parts[3..].join(":")),
    };

    Ok(BuiltinOutput::Values(vec![TypedValue::Str(packed)]))
}

fn extract(builtin: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    let datetime = parse_datetime(&inputs[0])?;
    let format = if builtin == "extract_date" { "%Y-%m-%d" } else { "%H:%M:%S" };

    Ok(BuiltinOutput::Values(vec![TypedValue::Str(datetime.format(format).to_string())]))
}

fn to_seconds(_: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    let datetime = parse_datetime(&inputs[0])?;
    let epoch = NaiveDate::from_ymd_opt(1900, 1, 1)
        .map(|date| date.and_time(NaiveTime::MIN))
        .ok_or_else(|| BuiltinError::Datetime("1900-01-01".to_string()))?;

    Ok(BuiltinOutput::Values(vec![TypedValue::Int(
        datetime.signed_duration_since(epoch).num_seconds(),
    )]))
}

fn shift_datetime(builtin: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    let datetime = parse_datetime(&inputs[0])?;
    let delta = parse_timedelta(&inputs[1])?;
    let shifted = if builtin == "datetime_plus" {
        datetime.checked_add_signed(delta)
    } else {
        datetime.checked_sub_signed(delta)
    }
    .ok_or(BuiltinError::Overflow(builtin))?;

    Ok(BuiltinOutput::Values(vec![TypedValue::Str(shifted.format(DATETIME_FORMAT).to_string())]))
}

fn compare_datetimes(builtin: &'static str, inputs: &[TypedValue]) -> Result<BuiltinOutput, BuiltinError> {
    let left = parse_datetime(&inputs[0])?;
    let right = parse_datetime(&inputs[1])?;

    Ok(BuiltinOutput::Truth(truth_of(builtin, left.cmp(&right))))
}

#[cfg(test)]
mod tests {
    use crate::evaluation::builtins::{builtin_for, registry, BuiltinError, BuiltinOutput};
    use datalog_syntax::*;
    use datalog_syntax_macros::literal;

    fn call(name: &str, inputs: Vec<TypedValue>) -> Result<BuiltinOutput, BuiltinError> {
        registry().get(name).unwrap().call(&inputs)
    }

    fn value(output: Result<BuiltinOutput, BuiltinError>) -> TypedValue {
        match output {
            Ok(BuiltinOutput::Values(mut values)) => values.remove(0),
            other => panic!("expected a value, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_respects_arity_and_service() {
        assert!(builtin_for(&literal!(lt(?x, ?y))).is_some());
        assert!(builtin_for(&literal!(lt(?x))).is_none());
        assert!(builtin_for(&literal!(builtin:plus(1, 2, ?z))).is_some());
        assert!(builtin_for(&literal!(nova:plus(1, 2, ?z))).is_none());
        assert_eq!(1, registry().get("plus").unwrap().num_outputs());
        assert_eq!(0, registry().get("gteq").unwrap().num_outputs());
        assert_eq!(vec!["comparison", "arithmetic", "string", "datetime"], registry().categories());
    }

    #[test]
    fn test_comparison_and_arithmetic() {
        assert_eq!(Ok(BuiltinOutput::Truth(true)), call("lt", vec![1.into(), 2.5.into()]));
        assert_eq!(Ok(BuiltinOutput::Truth(false)), call("gt", vec!["a".into(), "b".into()]));
        assert!(call("lt", vec!["a".into(), 1.into()]).is_err());
        assert_eq!(TypedValue::Int(7), value(call("max", vec![7.into(), 3.into()])));
        assert_eq!(TypedValue::Int(5), value(call("plus", vec![2.into(), 3.into()])));
        assert_eq!(TypedValue::Float(5.5), value(call("plus", vec![2.into(), 3.5.into()])));
        assert_eq!(TypedValue::Int(-4), value(call("div", vec![(-7).into(), 2.into()])));
        assert_eq!(Err(BuiltinError::DivisionByZero), call("div", vec![1.into(), 0.into()]));
        assert_eq!(TypedValue::Int(3), value(call("int", vec![3.9.into()])));
        assert_eq!(TypedValue::Float(2.0), value(call("float", vec!["2".into()])));
        assert_eq!(TypedValue::from("ab"), value(call("concat", vec!["a".into(), "b".into()])));
        assert_eq!(TypedValue::Int(3), value(call("len", vec!["abc".into()])));
    }

    #[test]
    fn test_datetimes() {
        assert_eq!(
            TypedValue::from("2014-01-01 00:01:10"),
            value(call("datetime_plus", vec!["2014-01-01 00:00:00".into(), "1:10".into()]))
        );
        assert_eq!(
            TypedValue::from("2013-12-31 23:59:00"),
            value(call("datetime_minus", vec!["2014-01-01".into(), 60.into()]))
        );
        assert_eq!(
            Ok(BuiltinOutput::Values(vec![2014.into(), 3.into(), 9.into()])),
            call("unpack_date", vec!["2014-03-09 10:11:12".into()])
        );
        assert_eq!(TypedValue::from("1:2:3"), value(call("pack_time", vec![1.into(), 2.into(), 3.into()])));
        assert_eq!(TypedValue::from("10:11:12"), value(call("extract_time", vec!["2014-03-09 10:11:12".into()])));
        assert_eq!(TypedValue::Int(86_400), value(call("datetime_to_seconds", vec!["1900-01-02".into()])));
        assert_eq!(
            Ok(BuiltinOutput::Truth(true)),
            call("datetime_lt", vec!["2014-01-01".into(), "2014-01-02 00:00:00".into()])
        );
        assert!(call("datetime_equal", vec!["garbage".into(), "2014-01-01".into()]).is_err());
    }

    #[test]
    fn test_oversized_durations_fail() {
        let start = || TypedValue::from("2014-01-01 00:00:00");
        for duration in [
            TypedValue::from("99999999999999999:0:0:0"),
            TypedValue::from("1:9223372036854775807"),
            TypedValue::Int(i64::MAX),
            TypedValue::Float(1e300),
            TypedValue::Float(f64::NAN),
        ] {
            assert!(matches!(
                call("datetime_plus", vec![start(), duration.clone()]),
                Err(BuiltinError::Conversion(_))
            ));
            assert!(call("datetime_minus", vec![start(), duration]).is_err());
        }
    }
}
