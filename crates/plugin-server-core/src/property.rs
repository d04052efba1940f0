//! Property classification.
//!
//! Every property seen on an event belongs to one of four namespaces:
//!
//! | source                                         | type      |
//! |------------------------------------------------|-----------|
//! | top-level event property                       | `event`   |
//! | `$session_*` event property (not `$session_id`) | `session` |
//! | keys of `$set` / `$set_once`                   | `person`  |
//! | keys of `$group_set` on `$groupidentify`       | `group`   |

use crate::event::Event;
use crate::filter::{FilterKey, PropertyFilter, ValueKinds};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const PERSON_SET: &str = "$set";
const PERSON_SET_ONCE: &str = "$set_once";
const GROUP_SET: &str = "$group_set";
const GROUP_TYPE: &str = "$group_type";
const GROUPS: &str = "$groups";
const GROUP_IDENTIFY_EVENT: &str = "$groupidentify";
const SESSION_PREFIX: &str = "$session_";
const SESSION_ID: &str = "$session_id";

/// Namespace a property definition belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Event,
    Person,
    Group,
    Session,
}

impl PropertyType {
    pub const ALL: [PropertyType; 4] = [Self::Event, Self::Person, Self::Group, Self::Session];

    /// Lowercase name as stored in the `prop_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Person => "person",
            Self::Group => "group",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(Self::Event),
            "person" => Ok(Self::Person),
            "group" => Ok(Self::Group),
            "session" => Ok(Self::Session),
            other => Err(format!("unknown property type '{other}'")),
        }
    }
}

/// Build one filter per property type from everything observed on `event`.
///
/// Types with no observed properties are absent from the result.
pub fn observe_event(event: &Event) -> BTreeMap<PropertyType, PropertyFilter> {
    let mut observed: BTreeMap<PropertyType, PropertyFilter> = BTreeMap::new();

    for (name, value) in &event.properties {
        match name.as_str() {
            PERSON_SET | PERSON_SET_ONCE => {
                if let Value::Object(props) = value {
                    let filter = observed.entry(PropertyType::Person).or_default();
                    for (key, v) in props {
                        filter.observe(FilterKey::new(key), ValueKinds::of(v));
                    }
                }
            }
            GROUP_SET => {
                if event.event != GROUP_IDENTIFY_EVENT {
                    continue;
                }
                let Some(Value::String(group_type)) = event.properties.get(GROUP_TYPE) else {
                    continue;
                };
                if let Value::Object(props) = value {
                    let filter = observed.entry(PropertyType::Group).or_default();
                    for (key, v) in props {
                        filter.observe(
                            FilterKey::grouped(group_type.clone(), key),
                            ValueKinds::of(v),
                        );
                    }
                }
            }
            GROUPS => {}
            _ => {
                let prop_type = if name.starts_with(SESSION_PREFIX) && name != SESSION_ID {
                    PropertyType::Session
                } else {
                    PropertyType::Event
                };
                observed
                    .entry(prop_type)
                    .or_default()
                    .observe(FilterKey::new(name), ValueKinds::of(value));
            }
        }
    }

    observed
}
