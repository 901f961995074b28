//! In-memory knowledge-base registry and static settings

use super::{
    KbSettingsProvider, KnowledgeBaseResolver, KnowledgeBaseSource, ResolvedKnowledgeBase,
    UserKbSettings,
};
use async_trait::async_trait;
use kbforge_common::errors::{AppError, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Resolver over a fixed set of registered knowledge bases
#[derive(Default)]
pub struct KbRegistry {
    entries: RwLock<HashMap<String, ResolvedKnowledgeBase>>,
}

impl KbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a knowledge base
    pub fn register(
        &self,
        id: impl Into<String>,
        external_id: impl Into<String>,
        label: impl Into<String>,
        source: Arc<dyn KnowledgeBaseSource>,
    ) {
        let id = id.into();
        let entry = ResolvedKnowledgeBase {
            id: id.clone(),
            external_id: external_id.into(),
            label: label.into(),
            source,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entry);
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KnowledgeBaseResolver for KbRegistry {
    async fn resolve(&self, knowledge_base_id: &str) -> Result<ResolvedKnowledgeBase> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(knowledge_base_id)
            .cloned()
            .ok_or_else(|| AppError::KnowledgeBaseNotFound {
                id: knowledge_base_id.to_string(),
            })
    }
}

/// Fixed per-user settings
#[derive(Debug, Clone, Default)]
pub struct StaticKbSettings {
    fallback: UserKbSettings,
    users: HashMap<String, UserKbSettings>,
}

impl StaticKbSettings {
    pub fn new(fallback: UserKbSettings) -> Self {
        Self {
            fallback,
            users: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>, settings: UserKbSettings) -> Self {
        self.users.insert(user_id.into(), settings);
        self
    }
}

#[async_trait]
impl KbSettingsProvider for StaticKbSettings {
    async fn settings_for(&self, user_id: &str) -> Result<UserKbSettings> {
        Ok(self.users.get(user_id).copied().unwrap_or(self.fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{KbSearchRequest, KbSearchResponse};

    struct EmptySource;

    #[async_trait]
    impl KnowledgeBaseSource for EmptySource {
        async fn search(&self, _request: &KbSearchRequest) -> Result<KbSearchResponse> {
            Ok(KbSearchResponse::default())
        }

        fn kind(&self) -> &str {
            "empty"
        }
    }

    #[tokio::test]
    async fn test_registry_resolves_registered_ids() {
        let registry = KbRegistry::new();
        registry.register("kb-1", "ext-1", "Handbook", Arc::new(EmptySource));
        assert_eq!(registry.len(), 1);

        let resolved = registry.resolve("kb-1").await.unwrap();
        assert_eq!(resolved.external_id, "ext-1");
        assert_eq!(resolved.label, "Handbook");
        assert_eq!(resolved.source.kind(), "empty");

        let err = registry.resolve("missing").await.unwrap_err();
        assert!(matches!(err, AppError::KnowledgeBaseNotFound { ref id } if id == "missing"));
    }

    #[tokio::test]
    async fn test_static_settings_per_user() {
        let settings = StaticKbSettings::default().with_user(
            "alice",
            UserKbSettings {
                max_results: Some(3),
                min_score: None,
            },
        );
        assert_eq!(settings.settings_for("alice").await.unwrap().max_results, Some(3));
        assert_eq!(
            settings.settings_for("bob").await.unwrap(),
            UserKbSettings::default()
        );
    }
}
