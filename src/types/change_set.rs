use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::Flag;

/// Resumption checkpoint handed out by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selector {
    pub version: i64,
    pub state: String,
}

impl Selector {
    /// No checkpoint yet.
    pub const EMPTY: Selector = Selector {
        version: 0,
        state: String::new(),
    };

    pub fn new(version: i64, state: impl Into<String>) -> Self {
        Self {
            version,
            state: state.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeSetType {
    /// Replaces the whole flag set.
    Full,
    /// Merges items key by key under the version rule.
    Partial,
    /// Carries only a selector.
    None,
}

/// A batch of flag changes produced by a data source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub change_type: ChangeSetType,
    pub selector: Selector,
    pub items: HashMap<String, Flag>,
    pub environment_id: Option<String>,
    pub should_persist: bool,
}

impl ChangeSet {
    pub fn new(
        change_type: ChangeSetType,
        selector: Selector,
        items: HashMap<String, Flag>,
        should_persist: bool,
    ) -> Self {
        Self {
            change_type,
            selector,
            items,
            environment_id: None,
            should_persist,
        }
    }

    pub fn full(items: impl IntoIterator<Item = Flag>, selector: Selector) -> Self {
        Self::new(ChangeSetType::Full, selector, collect(items), true)
    }

    pub fn partial(items: impl IntoIterator<Item = Flag>, selector: Selector) -> Self {
        Self::new(ChangeSetType::Partial, selector, collect(items), true)
    }

    pub fn none(selector: Selector) -> Self {
        Self::new(ChangeSetType::None, selector, HashMap::new(), false)
    }

    pub fn should_persist(mut self, persist: bool) -> Self {
        self.should_persist = persist;
        self
    }

    pub fn environment_id(mut self, id: impl Into<String>) -> Self {
        self.environment_id = Some(id.into());
        self
    }
}

fn collect(items: impl IntoIterator<Item = Flag>) -> HashMap<String, Flag> {
    items.into_iter().map(|f| (f.key.clone(), f)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_empty() {
        assert!(Selector::EMPTY.is_empty());
        assert!(Selector::default().is_empty());
        assert!(!Selector::new(42, "state-42").is_empty());
    }

    #[test]
    fn test_change_set_constructors() {
        let full = ChangeSet::full(vec![Flag::new("a", true, 1)], Selector::EMPTY);
        assert_eq!(full.change_type, ChangeSetType::Full);
        assert!(full.should_persist);
        assert!(full.items.contains_key("a"));

        let none = ChangeSet::none(Selector::new(1, "s"));
        assert_eq!(none.change_type, ChangeSetType::None);
        assert!(none.items.is_empty());
        assert!(!none.should_persist);

        let memory_only = ChangeSet::full(Vec::<Flag>::new(), Selector::EMPTY).should_persist(false);
        assert!(!memory_only.should_persist);
    }
}
