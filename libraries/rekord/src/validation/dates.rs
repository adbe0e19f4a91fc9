//! Date rules. Dates are compared as epoch milliseconds in UTC.
//!
//! A date expression is `now`, `today`, `tomorrow`, `yesterday`, a relative offset from now (`+2days`, `-1 week`), an absolute date (`2024-05-01` or RFC 3339), or the name of another field.

use chrono::{DateTime, Months, NaiveDate, TimeDelta, Utc};
use serde_json::Value;

use super::{Context, Rule};

/// Epoch milliseconds from a number, an RFC 3339 timestamp or a `YYYY-MM-DD` date.
pub(crate) fn parse_date(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => {
            let text = text.trim();
            DateTime::parse_from_rfc3339(text)
                .map(|date| date.timestamp_millis())
                .ok()
                .or_else(|| {
                    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
                    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
                })
        }
        _ => None,
    }
}

fn start_of_day(millis: i64) -> Option<i64> {
    let date = DateTime::<Utc>::from_timestamp_millis(millis)?.date_naive();
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
}

fn end_of_day(millis: i64) -> Option<i64> {
    let date = DateTime::<Utc>::from_timestamp_millis(millis)?.date_naive();
    Some(date.and_hms_milli_opt(23, 59, 59, 999)?.and_utc().timestamp_millis())
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Unit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Unit {
    fn parse(word: &str) -> Option<Self> {
        let word = word.trim().to_ascii_lowercase();
        Some(match word.strip_suffix('s').unwrap_or(&word) {
            "second" | "sec" => Unit::Second,
            "minute" | "min" => Unit::Minute,
            "hour" => Unit::Hour,
            "day" => Unit::Day,
            "week" => Unit::Week,
            "month" => Unit::Month,
            "year" => Unit::Year,
            _ => return None,
        })
    }

    fn offset(self, from: DateTime<Utc>, amount: i64) -> Option<DateTime<Utc>> {
        let delta = |delta: Option<TimeDelta>| from.checked_add_signed(delta?);
        let months = |months: i64| {
            let count = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
            if months < 0 {
                from.checked_sub_months(count)
            } else {
                from.checked_add_months(count)
            }
        };

        match self {
            Unit::Second => delta(TimeDelta::try_seconds(amount)),
            Unit::Minute => delta(TimeDelta::try_minutes(amount)),
            Unit::Hour => delta(TimeDelta::try_hours(amount)),
            Unit::Day => delta(TimeDelta::try_days(amount)),
            Unit::Week => delta(TimeDelta::try_weeks(amount)),
            Unit::Month => months(amount),
            Unit::Year => months(amount.checked_mul(12)?),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Expression {
    Now,
    Today,
    Tomorrow,
    Yesterday,
    Offset { amount: i64, unit: Unit },
    Fixed(i64),
    Field(String),
}

impl Expression {
    fn parse(text: &str, fields: &[String]) -> Option<Self> {
        let text = text.trim();
        match text.to_ascii_lowercase().as_str() {
            "now" => return Some(Expression::Now),
            "today" => return Some(Expression::Today),
            "tomorrow" => return Some(Expression::Tomorrow),
            "yesterday" => return Some(Expression::Yesterday),
            _ => {}
        }

        if let Some(sign) = text.chars().next().filter(|c| *c == '+' || *c == '-') {
            let body = text[1..].trim_start();
            let digits = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
            let amount: i64 = body[..digits].parse().ok()?;
            let unit = Unit::parse(&body[digits..])?;
            let amount = if sign == '-' { -amount } else { amount };
            return Some(Expression::Offset { amount, unit });
        }

        if let Some(millis) = parse_date(&Value::String(text.to_string())) {
            return Some(Expression::Fixed(millis));
        }

        fields
            .iter()
            .any(|field| field == text)
            .then(|| Expression::Field(text.to_string()))
    }

    fn evaluate(&self, context: &Context<'_>) -> Option<i64> {
        let now = Utc::now();
        let day = |days: i64| {
            let today = start_of_day(now.timestamp_millis())?;
            today.checked_add(TimeDelta::try_days(days)?.num_milliseconds())
        };

        match self {
            Expression::Now => Some(now.timestamp_millis()),
            Expression::Today => day(0),
            Expression::Tomorrow => day(1),
            Expression::Yesterday => day(-1),
            Expression::Offset { amount, unit } => {
                Some(unit.offset(now, *amount)?.timestamp_millis())
            }
            Expression::Fixed(millis) => Some(*millis),
            Expression::Field(field) => parse_date(context.values.get(field)?),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Comparison {
    /// Later than the whole day of the date.
    After,
    AfterOn,
    Before,
    /// No later than the end of the day of the date.
    BeforeOn,
}

impl Comparison {
    fn is_invalid(self, value: i64, date: i64) -> bool {
        match self {
            Comparison::After => end_of_day(date).is_some_and(|end| value < end),
            Comparison::AfterOn => value < date,
            Comparison::Before => value > date,
            Comparison::BeforeOn => end_of_day(date).is_some_and(|end| value > end),
        }
    }

    fn default_message(self) -> &'static str {
        match self {
            Comparison::After => "{$alias} must be after {$date}.",
            Comparison::AfterOn => "{$alias} must be after or equal to {$date}.",
            Comparison::Before => "{$alias} must be before {$date}.",
            Comparison::BeforeOn => "{$alias} must be before or equal to {$date}.",
        }
    }
}

/// `after`, `after_on`, `before` and `before_on`. Dates are stored back as epoch milliseconds.
/// Values that aren't dates pass untouched; pair with `date_like` to reject them.
pub(crate) struct DateRule {
    comparison: Comparison,
    expression: Expression,
    argument: String,
    template: String,
}

impl DateRule {
    pub(crate) fn new(
        name: &str,
        argument: &str,
        fields: &[String],
        template: Option<String>,
    ) -> Option<Self> {
        let comparison = match name {
            "after" => Comparison::After,
            "after_on" => Comparison::AfterOn,
            "before" => Comparison::Before,
            "before_on" => Comparison::BeforeOn,
            _ => return None,
        };
        Some(Self {
            comparison,
            expression: Expression::parse(argument, fields)?,
            argument: argument.to_string(),
            template: template.unwrap_or_else(|| comparison.default_message().to_string()),
        })
    }
}

impl Rule for DateRule {
    fn check(&self, value: &mut Value, context: &Context<'_>) -> Option<String> {
        let millis = parse_date(value)?;
        let arguments = [("$date", self.argument.as_str())];
        let message = self.expression.evaluate(context).and_then(|date| {
            self.comparison
                .is_invalid(millis, date)
                .then(|| context.message(&self.template, value, &arguments))
        });
        *value = Value::from(millis);
        message
    }
}

/// Accepts anything [`parse_date`] understands and stores it as epoch milliseconds. Null passes.
pub(crate) struct DateLike {
    template: String,
}

impl DateLike {
    pub(crate) fn new(template: Option<String>) -> Self {
        Self {
            template: template.unwrap_or_else(|| "{$alias} must be a valid date.".to_string()),
        }
    }
}

impl Rule for DateLike {
    fn check(&self, value: &mut Value, context: &Context<'_>) -> Option<String> {
        if value.is_null() {
            return None;
        }
        match parse_date(value) {
            Some(millis) => {
                *value = Value::from(millis);
                None
            }
            None => Some(context.message(&self.template, value, &[])),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::Record;
    use crate::test_support::record;

    fn check(rule: &dyn Rule, value: Value, values: &Record) -> (Value, Option<String>) {
        let mut value = value;
        let context = Context {
            alias: "Date",
            values,
        };
        let message = rule.check(&mut value, &context);
        (value, message)
    }

    fn rule(name: &str, argument: &str) -> DateRule {
        let fields = vec!["starts_at".to_string(), "ends_at".to_string()];
        DateRule::new(name, argument, &fields, None).unwrap()
    }

    fn now() -> Value {
        json!(Utc::now().timestamp_millis())
    }

    #[test]
    fn test_expressions() {
        let fields = vec!["ends_at".to_string()];
        assert_eq!(Expression::parse("Today", &fields), Some(Expression::Today));
        assert_eq!(
            Expression::parse("+2days", &fields),
            Some(Expression::Offset {
                amount: 2,
                unit: Unit::Day
            })
        );
        assert_eq!(
            Expression::parse("-1 week", &fields),
            Some(Expression::Offset {
                amount: -1,
                unit: Unit::Week
            })
        );
        assert_eq!(
            Expression::parse("ends_at", &fields),
            Some(Expression::Field("ends_at".to_string()))
        );
        assert!(matches!(
            Expression::parse("2024-05-01", &fields),
            Some(Expression::Fixed(_))
        ));
        assert_eq!(Expression::parse("+2 fortnights", &fields), None);
        assert_eq!(Expression::parse("someday", &fields), None);
    }

    #[test]
    fn test_relative_rules_against_now() {
        let values = Record::new();
        assert!(check(&rule("after", "yesterday"), now(), &values).1.is_none());
        assert!(check(&rule("after", "today"), now(), &values).1.is_some());
        assert!(check(&rule("after_on", "today"), now(), &values).1.is_none());
        assert!(check(&rule("before", "yesterday"), now(), &values).1.is_some());
        assert!(check(&rule("before_on", "today"), now(), &values).1.is_none());
        assert!(check(&rule("before", "+2days"), now(), &values).1.is_none());
        assert!(check(&rule("after", "+2days"), now(), &values).1.is_some());
    }

    #[test]
    fn test_fixed_dates_cover_the_whole_day() {
        let values = Record::new();
        let noon = json!("2024-01-01T12:00:00Z");
        let (value, message) = check(&rule("after", "2024-01-01"), noon, &values);
        assert_eq!(message.as_deref(), Some("Date must be after 2024-01-01."));
        assert_eq!(value, json!(1_704_110_400_000_i64));
        assert!(check(&rule("after", "2024-01-01"), json!("2024-01-02"), &values).1.is_none());

        let late = json!("2024-01-01T23:00:00Z");
        assert!(check(&rule("before_on", "2024-01-01"), late.clone(), &values).1.is_none());
        assert!(check(&rule("before", "2024-01-01"), late, &values).1.is_some());
    }

    #[test]
    fn test_field_references_and_non_dates() {
        let values = record(json!({"ends_at": "2024-06-01"}));
        assert!(check(&rule("before", "ends_at"), json!("2024-07-01"), &values).1.is_some());
        assert!(check(&rule("before", "ends_at"), json!("2024-05-01"), &values).1.is_none());
        assert!(check(&rule("before", "starts_at"), json!("2024-05-01"), &values).1.is_none());
        assert_eq!(
            check(&rule("after", "today"), json!("not a date"), &values),
            (json!("not a date"), None)
        );
        let (value, message) = check(&rule("before", "starts_at"), json!("2024-05-01"), &values);
        assert!(message.is_none());
        assert!(value.is_i64());
    }

    #[test]
    fn test_date_like_normalises() {
        let values = Record::new();
        let rule = DateLike::new(None);
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|date| date.and_utc().timestamp_millis())
            .unwrap();

        assert_eq!(check(&rule, json!("2024-03-01"), &values), (json!(expected), None));
        assert_eq!(check(&rule, Value::Null, &values), (Value::Null, None));
        assert_eq!(
            check(&rule, json!("March"), &values).1.as_deref(),
            Some("Date must be a valid date.")
        );
    }
}
