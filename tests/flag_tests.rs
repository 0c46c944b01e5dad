use flagkit_sync::types::{ChangeSet, ChangeSetType, EnvironmentData, Flag, FlagValue, Selector};

#[test]
fn test_value_accessors() {
    assert_eq!(FlagValue::Bool(true).as_bool(), Some(true));
    assert_eq!(FlagValue::from("hello").as_string(), Some("hello"));
    assert_eq!(FlagValue::Number(42.5).as_number(), Some(42.5));
    assert_eq!(FlagValue::Number(42.5).as_int(), Some(42));
    assert!(FlagValue::Null.is_null());
    assert!(FlagValue::Bool(true).as_string().is_none());
}

#[test]
fn test_value_from_json() {
    let value = FlagValue::from(serde_json::json!({
        "theme": "dark",
        "sizes": [1, 2],
        "enabled": true
    }));
    let object = value.as_object().unwrap();
    assert_eq!(object["theme"], FlagValue::from("dark"));
    assert_eq!(object["sizes"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(object["enabled"], FlagValue::Bool(true));
}

#[test]
fn test_value_serializes_untagged() {
    assert_eq!(serde_json::to_string(&FlagValue::Bool(true)).unwrap(), "true");
    assert_eq!(serde_json::to_string(&FlagValue::from("x")).unwrap(), "\"x\"");
    let parsed: FlagValue = serde_json::from_str("[1,\"a\",null]").unwrap();
    assert_eq!(
        parsed,
        FlagValue::Array(vec![
            FlagValue::Number(1.0),
            FlagValue::from("a"),
            FlagValue::Null
        ])
    );
}

#[test]
fn test_flag_builder() {
    let flag = Flag::builder("banner")
        .value("blue")
        .version(4)
        .variation(2)
        .build();

    assert_eq!(flag.key, "banner");
    assert_eq!(flag.value, FlagValue::from("blue"));
    assert_eq!(flag.version, Some(4));
    assert_eq!(flag.variation, Some(2));
    assert!(!flag.is_deleted());
}

#[test]
fn test_tombstone_serialization() {
    let json = serde_json::to_value(Flag::tombstone("gone", 9)).unwrap();
    assert_eq!(json["key"], "gone");
    assert_eq!(json["version"], 9);
    assert_eq!(json["deleted"], true);
    assert!(json.get("value").is_none());
}

#[test]
fn test_environment_data_json_round_trip() {
    let data: EnvironmentData = vec![Flag::new("a", true, 1), Flag::tombstone("b", 2)]
        .into_iter()
        .collect();
    let restored = EnvironmentData::from_json(&data.to_json().unwrap()).unwrap();

    assert_eq!(restored, data);
    assert_eq!(restored.non_deleted().len(), 1);
}

#[test]
fn test_environment_data_rejects_garbage() {
    assert!(EnvironmentData::from_json("not json").is_err());
}

#[test]
fn test_change_set_constructors() {
    let full = ChangeSet::full(vec![Flag::new("a", true, 1)], Selector::new(1, "s"));
    assert_eq!(full.change_type, ChangeSetType::Full);
    assert!(full.should_persist);
    assert!(full.items.contains_key("a"));

    let none = ChangeSet::none(Selector::new(2, "t"));
    assert_eq!(none.change_type, ChangeSetType::None);
    assert!(none.items.is_empty());

    assert!(Selector::EMPTY.is_empty());
    assert!(!Selector::new(0, "state").is_empty());
}
