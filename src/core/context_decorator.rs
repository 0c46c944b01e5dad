use super::persistence::PersistentStoreWrapper;
use crate::types::EvaluationContext;

/// Gives anonymous contexts a stable generated key.
#[derive(Clone)]
pub struct ContextDecorator {
    store: PersistentStoreWrapper,
    generate_anonymous_keys: bool,
}

impl ContextDecorator {
    pub fn new(store: PersistentStoreWrapper, generate_anonymous_keys: bool) -> Self {
        Self {
            store,
            generate_anonymous_keys,
        }
    }

    /// The context to synchronize for `context`.
    ///
    /// With key generation on, an anonymous context's key is replaced by
    /// the generated key for its kind. Other contexts pass through.
    pub fn decorate(&self, context: &EvaluationContext) -> EvaluationContext {
        if !self.generate_anonymous_keys || !context.anonymous {
            return context.clone();
        }
        let mut decorated = context.clone();
        decorated.key = self.store.get_or_generate_context_key(&context.kind);
        decorated
    }
}
