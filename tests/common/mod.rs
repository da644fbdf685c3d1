//! Shared helpers for integration tests, in the style of
//! `clawd/tests/policy_test.rs`'s top-of-file `make_engine`/`make_spec`
//! helpers.

use async_trait::async_trait;
use diagramd::authz::{AclEntry, AclPrincipal, AuthorizationData, Authorizer, Owner, Principal, ResourceType, Role};
use diagramd::config::HubConfig;
use diagramd::error::HubError;
use diagramd::hub::{AuthorizationSource, Hub};
use diagramd::store::InMemoryStore;
use std::sync::Arc;
use uuid::Uuid;

pub struct EveryoneWriter;

#[async_trait]
impl AuthorizationSource for EveryoneWriter {
    async fn load(&self, _threat_model_id: Uuid) -> Result<AuthorizationData, HubError> {
        Ok(AuthorizationData {
            resource_type: ResourceType::ThreatModel,
            owner: Owner { provider: None, id: "nobody".to_string() },
            acl: vec![AclEntry {
                principal: AclPrincipal::Group { provider: None, name: "everyone".to_string() },
                role: Role::Writer,
            }],
        })
    }
}

pub struct EveryoneReader;

#[async_trait]
impl AuthorizationSource for EveryoneReader {
    async fn load(&self, _threat_model_id: Uuid) -> Result<AuthorizationData, HubError> {
        Ok(AuthorizationData {
            resource_type: ResourceType::ThreatModel,
            owner: Owner { provider: None, id: "nobody".to_string() },
            acl: vec![AclEntry {
                principal: AclPrincipal::Group { provider: None, name: "everyone".to_string() },
                role: Role::Reader,
            }],
        })
    }
}

pub fn principal(user_id: &str) -> Principal {
    Principal { user_id: user_id.to_string(), ..Default::default() }
}

pub fn test_hub(authz_source: Arc<dyn AuthorizationSource>) -> (Arc<Hub>, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let config = Arc::new(HubConfig::new(None, Some(tempfile::tempdir().unwrap().into_path()), None, true));
    let hub = Arc::new(Hub::new(Arc::clone(&store) as Arc<dyn diagramd::store::Store>, authz_source, Arc::new(Authorizer::default()), config));
    (hub, store)
}
