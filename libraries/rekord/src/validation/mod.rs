//! Field validation.
//!
//! Rules are configured per field as `name:argument` strings, e.g. `"starts_at": ["date_like", "after:today"]`, or as one `|` separated string.
//! They are parsed once when the database is defined, so a bad rule is reported by [`crate::DatabaseBuilder::build`] rather than on every save.
//! A rule may normalise the value it checks; the normalised value is written back to the model.

mod dates;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::Record;
use crate::error::{RekordError, Result};

/// Failed fields with their messages, in rule order.
pub type ValidationMessages = IndexMap<String, Vec<String>>;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationOptions {
    #[serde(deserialize_with = "rule_lists")]
    pub rules: IndexMap<String, Vec<String>>,
    /// Message templates by rule name, replacing the built-in ones.
    pub messages: IndexMap<String, String>,
    /// Names used for `{$alias}` in messages. Defaults to the field name.
    pub aliases: IndexMap<String, String>,
    /// Refuse to save a model that fails validation.
    pub required: bool,
}

fn rule_lists<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<IndexMap<String, Vec<String>>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Rules {
        Joined(String),
        List(Vec<String>),
    }

    let rules = IndexMap::<String, Rules>::deserialize(deserializer)?;
    Ok(rules
        .into_iter()
        .map(|(field, rules)| {
            let rules = match rules {
                Rules::Joined(joined) => joined
                    .split('|')
                    .map(str::trim)
                    .filter(|rule| !rule.is_empty())
                    .map(str::to_string)
                    .collect(),
                Rules::List(list) => list,
            };
            (field, rules)
        })
        .collect())
}

/// What a rule sees besides the value it checks.
pub(crate) struct Context<'a> {
    alias: &'a str,
    values: &'a Record,
}

impl Context<'_> {
    /// Fills in `{$alias}`, `{$value}`, the `extra` placeholders and `{field}` references. Unknown placeholders are left alone.
    fn message(&self, template: &str, value: &Value, extra: &[(&str, &str)]) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                rest = &rest[open..];
                break;
            };

            let name = &after[..close];
            let replacement = match name {
                "$alias" => Some(self.alias.to_string()),
                "$value" => Some(display(value)),
                _ => extra
                    .iter()
                    .find(|(placeholder, _)| *placeholder == name)
                    .map(|(_, text)| text.to_string())
                    .or_else(|| self.values.get(name).map(display)),
            };
            match replacement {
                Some(text) => out.push_str(&text),
                None => out.push_str(&rest[open..open + close + 2]),
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        out
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub(crate) trait Rule {
    /// Returns a message when `value` fails the rule. May replace `value` with a normalised form.
    fn check(&self, value: &mut Value, context: &Context<'_>) -> Option<String>;
}

struct FieldRules {
    field: String,
    alias: String,
    rules: Vec<Box<dyn Rule>>,
}

pub(crate) struct Validator {
    fields: Vec<FieldRules>,
}

impl Validator {
    pub(crate) fn new(options: &ValidationOptions, fields: &[String]) -> Result<Self> {
        let fields = options
            .rules
            .iter()
            .map(|(field, rules)| {
                let rules = rules
                    .iter()
                    .map(|rule| parse_rule(field, rule, options, fields))
                    .collect::<Result<Vec<_>>>()?;
                Ok(FieldRules {
                    field: field.clone(),
                    alias: options
                        .aliases
                        .get(field)
                        .cloned()
                        .unwrap_or_else(|| field.clone()),
                    rules,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { fields })
    }

    /// Runs every rule over `values`, writing normalised values back.
    pub(crate) fn validate(&self, values: &mut Record) -> ValidationMessages {
        let mut messages = ValidationMessages::new();

        for field_rules in &self.fields {
            let original = values.get(&field_rules.field).cloned();
            let mut value = original.clone().unwrap_or(Value::Null);
            let context = Context {
                alias: &field_rules.alias,
                values,
            };

            let failed: Vec<String> = field_rules
                .rules
                .iter()
                .filter_map(|rule| rule.check(&mut value, &context))
                .collect();
            if !failed.is_empty() {
                messages.insert(field_rules.field.clone(), failed);
            }

            if original.as_ref() != Some(&value) && !(original.is_none() && value.is_null()) {
                values.insert(field_rules.field.clone(), value);
            }
        }

        messages
    }
}

fn parse_rule(
    field: &str,
    rule: &str,
    options: &ValidationOptions,
    fields: &[String],
) -> Result<Box<dyn Rule>> {
    let (name, argument) = match rule.split_once(':') {
        Some((name, argument)) => (name.trim(), Some(argument.trim())),
        None => (rule.trim(), None),
    };
    let invalid = |reason: String| RekordError::InvalidRule {
        field: field.to_string(),
        rule: name.to_string(),
        reason,
    };
    let template = options.messages.get(name).cloned();

    match name {
        "after" | "after_on" | "before" | "before_on" => {
            let argument = argument
                .filter(|argument| !argument.is_empty())
                .ok_or_else(|| invalid("a date expression argument is required".to_string()))?;
            let rule = dates::DateRule::new(name, argument, fields, template)
                .ok_or_else(|| invalid(format!("{argument} is not a valid date expression")))?;
            Ok(Box::new(rule))
        }
        "date_like" => Ok(Box::new(dates::DateLike::new(template))),
        _ => Err(invalid("no such rule".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::options::DatabaseOptions;
    use crate::store::Store;
    use crate::test_support::{init_logging, record};
    use crate::EventKind;

    fn options(rules: Value) -> ValidationOptions {
        serde_json::from_value(json!({ "rules": rules })).unwrap()
    }

    #[test]
    fn test_rules_accept_joined_strings() {
        let options = options(json!({"starts_at": "date_like|after:2024-01-01"}));
        assert_eq!(
            options.rules["starts_at"],
            vec!["date_like".to_string(), "after:2024-01-01".to_string()]
        );
    }

    #[test]
    fn test_bad_rules_fail_at_definition() {
        let fields = vec!["starts_at".to_string()];
        for rules in [json!(["after"]), json!(["after:someday"]), json!(["shiny"])] {
            let error = Validator::new(&options(json!({ "starts_at": rules })), &fields)
                .err()
                .unwrap();
            assert!(matches!(error, RekordError::InvalidRule { .. }), "{error}");
        }
    }

    #[test]
    fn test_messages_fill_placeholders() {
        let context = Context {
            alias: "Start",
            values: &record(json!({"name": "Launch"})),
        };
        assert_eq!(
            context.message(
                "{$alias} of {name} is {$value}, not after {$date} {unknown}",
                &json!("2020-01-01"),
                &[("$date", "today")]
            ),
            "Start of Launch is 2020-01-01, not after today {unknown}"
        );
    }

    #[test]
    fn test_required_validation_blocks_save() {
        init_logging();
        let store = Store::default();
        let events = store
            .define(DatabaseOptions {
                name: "event".to_string(),
                fields: vec!["starts_at".to_string()],
                validation: serde_json::from_value(json!({
                    "rules": {"starts_at": "after:today"},
                    "aliases": {"starts_at": "Start"},
                    "required": true
                }))
                .unwrap(),
                ..Default::default()
            })
            .build()
            .unwrap();

        let event = events
            .instantiate(record(json!({"id": "1", "starts_at": "2001-01-01"})))
            .unwrap();
        let invalid = std::rc::Rc::new(std::cell::Cell::new(false));
        let flag = invalid.clone();
        event.on(&[EventKind::Invalid], move |_, _| flag.set(true));

        let expected: ValidationMessages = IndexMap::from([(
            "starts_at".to_string(),
            vec!["Start must be after today.".to_string()],
        )]);
        assert_eq!(
            event.save().unwrap_err(),
            RekordError::Invalid {
                database: "event".to_string(),
                messages: expected.clone(),
            }
        );
        assert!(invalid.get());
        assert_eq!(event.validation_messages(), expected);
        assert!(!event.exists());

        event.set("starts_at", "2999-01-01").unwrap();
        assert!(event.validate());
        assert_eq!(event.get("starts_at"), Some(json!(32_472_144_000_000_i64)));
        assert!(event.save().is_ok());
    }
}
