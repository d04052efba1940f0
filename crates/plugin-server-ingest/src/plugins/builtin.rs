//! Built-in plugins.

use super::{Plugin, PluginContext, PluginExecutionError, PluginOutcome};
use async_trait::async_trait;
use plugin_server_core::Event;
use serde_json::{Map, Value};

/// Drops events whose name is listed in `events`.
pub struct DropEvents;

#[async_trait]
impl Plugin for DropEvents {
    fn id(&self) -> &str {
        "drop-events"
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    async fn transform(
        &self,
        event: Event,
        ctx: &PluginContext,
    ) -> Result<PluginOutcome, PluginExecutionError> {
        let dropped = ctx.string_list("events")?;
        if dropped.iter().any(|name| *name == event.event) {
            return Ok(PluginOutcome::Drop);
        }
        Ok(PluginOutcome::Continue(event))
    }
}

/// Removes the properties listed in `properties`.
pub struct PropertyFilterPlugin;

#[async_trait]
impl Plugin for PropertyFilterPlugin {
    fn id(&self) -> &str {
        "property-filter"
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    async fn transform(
        &self,
        mut event: Event,
        ctx: &PluginContext,
    ) -> Result<PluginOutcome, PluginExecutionError> {
        for name in ctx.string_list("properties")? {
            event.properties.remove(&name);
        }
        Ok(PluginOutcome::Continue(event))
    }
}

/// Containers that carry person/group updates rather than event data.
const RESERVED_CONTAINERS: &[&str] = &["$set", "$set_once", "$group_set", "$groups"];

const DEFAULT_SEPARATOR: &str = "__";

/// Replaces nested object properties with flattened `parent<sep>child` keys.
///
/// Arrays and the `$set`-style containers are left untouched.
pub struct FlattenProperties;

impl FlattenProperties {
    fn flatten_into(prefix: &str, value: Map<String, Value>, sep: &str, out: &mut Map<String, Value>) {
        for (key, child) in value {
            let flat_key = format!("{prefix}{sep}{key}");
            match child {
                Value::Object(nested) => Self::flatten_into(&flat_key, nested, sep, out),
                other => {
                    out.insert(flat_key, other);
                }
            }
        }
    }
}

#[async_trait]
impl Plugin for FlattenProperties {
    fn id(&self) -> &str {
        "flatten-properties"
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    async fn transform(
        &self,
        mut event: Event,
        ctx: &PluginContext,
    ) -> Result<PluginOutcome, PluginExecutionError> {
        let sep = ctx.string("separator")?.unwrap_or(DEFAULT_SEPARATOR).to_string();
        if sep.is_empty() {
            return Err(PluginExecutionError::InvalidConfig(
                "'separator' must not be empty".to_string(),
            ));
        }

        let nested: Vec<String> = event
            .properties
            .iter()
            .filter(|(k, v)| v.is_object() && !RESERVED_CONTAINERS.contains(&k.as_str()))
            .map(|(k, _)| k.clone())
            .collect();

        let mut flattened = Map::new();
        for key in nested {
            if let Some(Value::Object(inner)) = event.properties.remove(&key) {
                Self::flatten_into(&key, inner, &sep, &mut flattened);
            }
        }
        event.properties.extend(flattened);

        Ok(PluginOutcome::Continue(event))
    }
}

/// Naming conventions supported by [`Taxonomy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingStyle {
    CamelCase,
    PascalCase,
    SnakeCase,
    KebabCase,
    Spaces,
}

impl NamingStyle {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "camelCase" => Some(Self::CamelCase),
            "PascalCase" => Some(Self::PascalCase),
            "snake_case" => Some(Self::SnakeCase),
            "kebab-case" => Some(Self::KebabCase),
            "spaces" | "spaces in between" => Some(Self::Spaces),
            _ => None,
        }
    }

    /// Rewrite `name` in this style.
    ///
    /// Applying a style to its own output returns the output unchanged.
    pub fn apply(self, name: &str) -> String {
        let words = split_words(name);
        match self {
            Self::CamelCase => merge_hidden_boundaries(words, false)
                .iter()
                .enumerate()
                .map(|(i, w)| if i == 0 { w.clone() } else { capitalize(w) })
                .collect(),
            Self::PascalCase => merge_hidden_boundaries(words, true)
                .iter()
                .map(|w| capitalize(w))
                .collect(),
            Self::SnakeCase => words.join("_"),
            Self::KebabCase => words.join("-"),
            Self::Spaces => words.join(" "),
        }
    }
}

/// Split an identifier into lowercase words on separators and case changes.
///
/// Separators are ASCII punctuation and whitespace. Only ASCII letters are
/// case-mapped; any other character is kept verbatim inside its word.
///
/// `"HTTPServer error"` → `["http", "server", "error"]`.
fn split_words(name: &str) -> Vec<String> {
    let chars: Vec<char> = name.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii() && !c.is_ascii_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_ascii_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if !prev.is_ascii_uppercase() || next_is_lower {
                words.push(std::mem::take(&mut current));
            }
        }
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Merge words whose boundary would not survive camel/Pascal rendering.
///
/// A word that does not start with an ASCII lowercase letter gains no
/// capital, and a capitalized single letter followed by a capital that is
/// not itself followed by a lowercase letter reads as one acronym. Both
/// would be split differently on the next pass, so they are joined up front.
fn merge_hidden_boundaries(words: Vec<String>, capitalize_first: bool) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(words.len());

    for word in words {
        let prev_is_first = merged.len() == 1;
        let Some(prev) = merged.last_mut() else {
            merged.push(word);
            continue;
        };

        let starts_lower = word.starts_with(|c: char| c.is_ascii_lowercase());
        let prev_is_capital_letter = prev.len() == 1
            && prev.starts_with(|c: char| c.is_ascii_lowercase())
            && (capitalize_first || !prev_is_first);
        let second_is_lower = word.chars().nth(1).is_some_and(|c| c.is_ascii_lowercase());

        if !starts_lower || (prev_is_capital_letter && !second_is_lower) {
            prev.push_str(&word);
        } else {
            merged.push(word);
        }
    }
    merged
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => std::iter::once(first.to_ascii_uppercase()).chain(chars).collect(),
        None => String::new(),
    }
}

/// Rewrites event names to a consistent naming `style` (default camelCase).
///
/// Events whose name starts with `$` are emitted by client libraries and
/// are never renamed.
pub struct Taxonomy;

#[async_trait]
impl Plugin for Taxonomy {
    fn id(&self) -> &str {
        "taxonomy"
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    async fn transform(
        &self,
        mut event: Event,
        ctx: &PluginContext,
    ) -> Result<PluginOutcome, PluginExecutionError> {
        let style = match ctx.string("style")? {
            None => NamingStyle::CamelCase,
            Some(raw) => NamingStyle::parse(raw).ok_or_else(|| {
                PluginExecutionError::InvalidConfig(format!("unknown naming style '{raw}'"))
            })?,
        };

        if event.event.starts_with('$') {
            return Ok(PluginOutcome::Continue(event));
        }

        let renamed = style.apply(&event.event);
        if !renamed.is_empty() {
            event.event = renamed;
        }
        Ok(PluginOutcome::Continue(event))
    }
}

/// Sets every key of the `properties` object onto the event.
pub struct SetProperty;

#[async_trait]
impl Plugin for SetProperty {
    fn id(&self) -> &str {
        "set-property"
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    async fn transform(
        &self,
        mut event: Event,
        ctx: &PluginContext,
    ) -> Result<PluginOutcome, PluginExecutionError> {
        match ctx.config.get("properties") {
            None | Some(Value::Null) => {}
            Some(Value::Object(props)) => {
                for (key, value) in props {
                    event.properties.insert(key.clone(), value.clone());
                }
            }
            Some(_) => {
                return Err(PluginExecutionError::InvalidConfig(
                    "'properties' must be an object".to_string(),
                ));
            }
        }
        Ok(PluginOutcome::Continue(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(config: Value) -> PluginContext {
        let Value::Object(map) = config else {
            panic!("config must be an object");
        };
        PluginContext {
            team_id: 42,
            config: Arc::new(map),
        }
    }

    fn event(name: &str) -> Event {
        Event::new(42, name, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    fn unwrap_continue(outcome: PluginOutcome) -> Event {
        match outcome {
            PluginOutcome::Continue(e) => e,
            PluginOutcome::Drop => panic!("unexpected drop"),
        }
    }

    #[tokio::test]
    async fn test_drop_events() {
        let c = ctx(json!({"events": ["$autocapture", "spam"]}));
        assert_eq!(
            DropEvents.transform(event("spam"), &c).await.unwrap(),
            PluginOutcome::Drop
        );
        let kept = DropEvents.transform(event("pageview"), &c).await.unwrap();
        assert_eq!(unwrap_continue(kept).event, "pageview");
    }

    #[tokio::test]
    async fn test_property_filter() {
        let c = ctx(json!({"properties": ["$ip", "email"]}));
        let e = event("pageview")
            .with_property("$ip", "1.2.3.4")
            .with_property("$browser", "Chrome");
        let out = unwrap_continue(PropertyFilterPlugin.transform(e, &c).await.unwrap());
        assert!(!out.properties.contains_key("$ip"));
        assert_eq!(out.properties["$browser"], "Chrome");
    }

    #[tokio::test]
    async fn test_flatten_properties() {
        let c = ctx(json!({}));
        let e = event("purchase")
            .with_property("cart", json!({"total": 10, "item": {"sku": "a1"}}))
            .with_property("tags", json!(["x"]))
            .with_property("$set", json!({"plan": {"tier": "pro"}}));
        let out = unwrap_continue(FlattenProperties.transform(e, &c).await.unwrap());
        assert_eq!(out.properties["cart__total"], 10);
        assert_eq!(out.properties["cart__item__sku"], "a1");
        assert!(!out.properties.contains_key("cart"));
        assert_eq!(out.properties["tags"], json!(["x"]));
        assert_eq!(out.properties["$set"], json!({"plan": {"tier": "pro"}}));

        let again = unwrap_continue(FlattenProperties.transform(out.clone(), &c).await.unwrap());
        assert_eq!(again, out);
    }

    #[tokio::test]
    async fn test_flatten_custom_separator() {
        let c = ctx(json!({"separator": "."}));
        let e = event("x").with_property("a", json!({"b": 1}));
        let out = unwrap_continue(FlattenProperties.transform(e, &c).await.unwrap());
        assert_eq!(out.properties["a.b"], 1);

        let bad = ctx(json!({"separator": ""}));
        assert!(FlattenProperties.transform(event("x"), &bad).await.is_err());
    }

    #[test]
    fn test_split_words() {
        assert_eq!(split_words("HTTPServer error"), vec!["http", "server", "error"]);
        assert_eq!(split_words("user_signed-up"), vec!["user", "signed", "up"]);
        assert_eq!(split_words("pageView2Done"), vec!["page", "view2", "done"]);
        assert!(split_words("--").is_empty());
    }

    #[test]
    fn test_split_words_leaves_non_ascii_alone() {
        assert_eq!(split_words("Café Ouvert"), vec!["café", "ouvert"]);
        assert_eq!(split_words("İstanbul"), vec!["İstanbul"]);
    }

    #[test]
    fn test_single_letter_words_keep_a_stable_name() {
        assert_eq!(NamingStyle::CamelCase.apply("buy a b"), "buyAb");
        assert_eq!(NamingStyle::CamelCase.apply("buyAb"), "buyAb");
        assert_eq!(NamingStyle::PascalCase.apply("a b c"), "AbC");
        assert_eq!(NamingStyle::PascalCase.apply("AbC"), "AbC");
        assert_eq!(NamingStyle::CamelCase.apply("step 2 done"), "step2Done");
        assert_eq!(NamingStyle::PascalCase.apply("a Bc"), "ABc");
        assert_eq!(NamingStyle::PascalCase.apply("ABc"), "ABc");
    }

    #[test]
    fn test_naming_styles() {
        let name = "User Signed Up";
        assert_eq!(NamingStyle::CamelCase.apply(name), "userSignedUp");
        assert_eq!(NamingStyle::PascalCase.apply(name), "UserSignedUp");
        assert_eq!(NamingStyle::SnakeCase.apply(name), "user_signed_up");
        assert_eq!(NamingStyle::KebabCase.apply(name), "user-signed-up");
        assert_eq!(NamingStyle::Spaces.apply("userSignedUp"), "user signed up");
    }

    #[tokio::test]
    async fn test_taxonomy_is_idempotent_and_skips_builtin_events() {
        let c = ctx(json!({"style": "snake_case"}));
        let once = unwrap_continue(Taxonomy.transform(event("User Signed Up"), &c).await.unwrap());
        assert_eq!(once.event, "user_signed_up");
        let twice = unwrap_continue(Taxonomy.transform(once.clone(), &c).await.unwrap());
        assert_eq!(twice, once);

        let builtin = unwrap_continue(Taxonomy.transform(event("$pageview"), &c).await.unwrap());
        assert_eq!(builtin.event, "$pageview");

        let bad = ctx(json!({"style": "SCREAMING"}));
        assert!(matches!(
            Taxonomy.transform(event("a"), &bad).await,
            Err(PluginExecutionError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_set_property() {
        let c = ctx(json!({"properties": {"env": "prod"}}));
        let out = unwrap_continue(SetProperty.transform(event("a"), &c).await.unwrap());
        assert_eq!(out.properties["env"], "prod");

        let bad = ctx(json!({"properties": "env=prod"}));
        assert!(SetProperty.transform(event("a"), &bad).await.is_err());
    }
}
