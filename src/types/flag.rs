use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::FlagValue;
use crate::error::Result;

/// Why a flag evaluated to its value, as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationReason {
    Off,
    Fallthrough {
        #[serde(default, rename = "inExperiment")]
        in_experiment: bool,
    },
    TargetMatch,
    RuleMatch {
        #[serde(rename = "ruleIndex")]
        rule_index: u32,
        #[serde(default, rename = "ruleId")]
        rule_id: Option<String>,
    },
    PrerequisiteFailed {
        #[serde(rename = "prerequisiteKey")]
        prerequisite_key: String,
    },
    Error {
        #[serde(rename = "errorKind")]
        error_kind: String,
    },
}

/// One flag as delivered for a context.
///
/// A tombstone keeps the key and version with `deleted` set and no value,
/// so deletes are ordered by the same version rule as updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    #[serde(default, skip_serializing_if = "FlagValue::is_null")]
    pub value: FlagValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<i32>,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_reason: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EvaluationReason>,
    #[serde(default)]
    pub deleted: bool,
}

impl Flag {
    pub fn new(key: impl Into<String>, value: impl Into<FlagValue>, version: i64) -> Self {
        FlagBuilder::new(key).value(value).version(version).build()
    }

    pub fn builder(key: impl Into<String>) -> FlagBuilder {
        FlagBuilder::new(key)
    }

    /// Deletion marker for `key` at `version`.
    pub fn tombstone(key: impl Into<String>, version: i64) -> Self {
        Self {
            key: key.into(),
            value: FlagValue::Null,
            version: Some(version),
            flag_version: None,
            variation: None,
            track_events: false,
            track_reason: false,
            debug_events_until_date: None,
            reason: None,
            deleted: true,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Version reported in analytics events: the finer-grained flag version
    /// when present, otherwise the data version.
    pub fn version_for_events(&self) -> Option<i64> {
        self.flag_version.or(self.version)
    }

    /// Whether this flag should replace `existing` in storage.
    ///
    /// Only a strictly newer version wins. Re-delivery of the same version
    /// and out-of-order delivery of older ones are both no-ops.
    pub fn supersedes(&self, existing: Option<&Flag>) -> bool {
        match existing {
            None => true,
            Some(existing) => self.version > existing.version,
        }
    }
}

pub struct FlagBuilder {
    flag: Flag,
}

impl FlagBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            flag: Flag {
                key: key.into(),
                value: FlagValue::Null,
                version: None,
                flag_version: None,
                variation: None,
                track_events: false,
                track_reason: false,
                debug_events_until_date: None,
                reason: None,
                deleted: false,
            },
        }
    }

    pub fn value(mut self, value: impl Into<FlagValue>) -> Self {
        self.flag.value = value.into();
        self
    }

    pub fn version(mut self, version: i64) -> Self {
        self.flag.version = Some(version);
        self
    }

    pub fn flag_version(mut self, version: i64) -> Self {
        self.flag.flag_version = Some(version);
        self
    }

    pub fn variation(mut self, variation: i32) -> Self {
        self.flag.variation = Some(variation);
        self
    }

    pub fn track_events(mut self, track: bool) -> Self {
        self.flag.track_events = track;
        self
    }

    pub fn track_reason(mut self, track: bool) -> Self {
        self.flag.track_reason = track;
        self
    }

    pub fn debug_events_until_date(mut self, millis: i64) -> Self {
        self.flag.debug_events_until_date = Some(millis);
        self
    }

    pub fn reason(mut self, reason: EvaluationReason) -> Self {
        self.flag.reason = Some(reason);
        self
    }

    pub fn deleted(mut self, deleted: bool) -> Self {
        self.flag.deleted = deleted;
        self
    }

    pub fn build(self) -> Flag {
        self.flag
    }
}

/// Full known flag state for one context in one environment, tombstones
/// included.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentData {
    flags: HashMap<String, Flag>,
}

impl EnvironmentData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_flags(flags: HashMap<String, Flag>) -> Self {
        Self { flags }
    }

    pub fn get(&self, key: &str) -> Option<&Flag> {
        self.flags.get(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &Flag> {
        self.flags.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.flags.keys()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn insert(&mut self, flag: Flag) {
        self.flags.insert(flag.key.clone(), flag);
    }

    /// Copy with `flag` added or replacing the entry for its key.
    pub fn with_flag_updated_or_added(&self, flag: Flag) -> Self {
        let mut updated = self.clone();
        updated.insert(flag);
        updated
    }

    /// Copy without tombstones.
    pub fn non_deleted(&self) -> Self {
        Self {
            flags: self
                .flags
                .iter()
                .filter(|(_, flag)| !flag.deleted)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn into_flags(self) -> HashMap<String, Flag> {
        self.flags
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl FromIterator<Flag> for EnvironmentData {
    fn from_iter<I: IntoIterator<Item = Flag>>(iter: I) -> Self {
        Self {
            flags: iter.into_iter().map(|f| (f.key.clone(), f)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone() {
        let flag = Flag::tombstone("gone", 7);
        assert!(flag.is_deleted());
        assert_eq!(flag.version, Some(7));
        assert!(flag.value.is_null());
    }

    #[test]
    fn test_version_for_events_prefers_flag_version() {
        let flag = Flag::builder("a").version(3).flag_version(12).build();
        assert_eq!(flag.version_for_events(), Some(12));

        let flag = Flag::builder("a").version(3).build();
        assert_eq!(flag.version_for_events(), Some(3));
    }

    #[test]
    fn test_supersedes() {
        let existing = Flag::new("a", true, 2);
        assert!(Flag::new("a", false, 3).supersedes(Some(&existing)));
        assert!(!Flag::new("a", false, 2).supersedes(Some(&existing)));
        assert!(!Flag::new("a", false, 1).supersedes(Some(&existing)));
        assert!(Flag::new("a", false, 1).supersedes(None));
        assert!(!Flag::tombstone("a", 2).supersedes(Some(&existing)));
        assert!(Flag::tombstone("a", 3).supersedes(Some(&existing)));
    }

    #[test]
    fn test_unversioned_flag_never_supersedes_versioned() {
        let existing = Flag::new("a", true, 1);
        let unversioned = Flag::builder("a").value(false).build();
        assert!(!unversioned.supersedes(Some(&existing)));
    }

    #[test]
    fn test_environment_data_json() {
        let data: EnvironmentData = vec![
            Flag::new("a", true, 1),
            Flag::builder("b")
                .value("x")
                .version(2)
                .reason(EvaluationReason::RuleMatch {
                    rule_index: 1,
                    rule_id: Some("r1".to_string()),
                })
                .build(),
            Flag::tombstone("c", 3),
        ]
        .into_iter()
        .collect();

        let json = data.to_json().unwrap();
        let restored = EnvironmentData::from_json(&json).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_reads_service_json() {
        let json = r#"{"flag1":{"key":"flag1","value":true,"version":5,"flagVersion":9,
            "variation":0,"trackEvents":true,"reason":{"kind":"OFF"}}}"#;
        let data = EnvironmentData::from_json(json).unwrap();
        let flag = data.get("flag1").unwrap();
        assert_eq!(flag.value, FlagValue::Bool(true));
        assert_eq!(flag.version_for_events(), Some(9));
        assert!(flag.track_events);
        assert_eq!(flag.reason, Some(EvaluationReason::Off));
        assert!(!flag.deleted);
    }

    #[test]
    fn test_non_deleted_filters_tombstones() {
        let data: EnvironmentData = vec![Flag::new("a", true, 1), Flag::tombstone("b", 2)]
            .into_iter()
            .collect();
        let visible = data.non_deleted();
        assert_eq!(visible.len(), 1);
        assert!(visible.get("a").is_some());
        assert!(visible.get("b").is_none());
    }
}
