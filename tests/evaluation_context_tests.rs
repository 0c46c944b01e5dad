use flagkit_sync::{EvaluationContext, EvaluationContextBuilder, FlagValue};

#[test]
fn test_default_kind_is_user() {
    let context = EvaluationContext::new("user-123");

    assert_eq!(context.kind, "user");
    assert_eq!(context.key, "user-123");
    assert!(!context.anonymous);
    assert!(context.attributes.is_empty());
}

#[test]
fn test_context_builder() {
    let context = EvaluationContextBuilder::new("device-9")
        .kind("device")
        .anonymous(true)
        .attribute("os", "android")
        .attribute("beta", true)
        .build();

    assert_eq!(context.kind, "device");
    assert!(context.anonymous);
    assert_eq!(context.get("os"), Some(&FlagValue::from("android")));
    assert_eq!(context.get("beta"), Some(&FlagValue::Bool(true)));
    assert!(context.get("missing").is_none());
}

#[test]
fn test_context_chained_methods() {
    let context = EvaluationContext::new("user-456")
        .anonymous(true)
        .attribute("count", 10_i32);

    assert!(context.anonymous);
    assert_eq!(context.get("count").and_then(|v| v.as_int()), Some(10));
}

#[test]
fn test_fully_qualified_key_for_user() {
    assert_eq!(EvaluationContext::new("abc").fully_qualified_key(), "abc");
    assert_eq!(EvaluationContext::new("a:b").fully_qualified_key(), "a:b");
}

#[test]
fn test_fully_qualified_key_escapes_other_kinds() {
    let context = EvaluationContext::with_kind("org", "acme:100%");
    assert_eq!(context.fully_qualified_key(), "org:acme%3A100%25");
}

#[test]
fn test_attributes_do_not_affect_identity() {
    let plain = EvaluationContext::new("same");
    let decorated = EvaluationContext::new("same").attribute("plan", "pro");
    assert_eq!(plain.fully_qualified_key(), decorated.fully_qualified_key());
}

#[test]
fn test_serialization() {
    let context = EvaluationContext::with_kind("device", "d-1").anonymous(true);
    let json = serde_json::to_value(&context).unwrap();

    assert_eq!(json["kind"], "device");
    assert_eq!(json["key"], "d-1");
    assert_eq!(json["anonymous"], true);
    assert!(json.get("attributes").is_none());

    let restored: EvaluationContext = serde_json::from_value(json).unwrap();
    assert_eq!(restored, context);
}
