//! Lookup table from (form, analysis pass) to the model endpoint that serves it.

use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::{Settings, TenantCredentials};
use crate::forms::{FormId, FormRegistry, Tenant};

/// The two analysis passes a form supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    Extraction,
    Signature,
}

/// Endpoint, credential and model id for one analysis call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRoute {
    pub endpoint: String,
    pub api_key: String,
    pub model_id: String,
}

/// Resolved once at startup; immutable afterwards.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<(FormId, ModelVariant), ModelRoute>,
}

impl RoutingTable {
    pub fn build(registry: &FormRegistry, settings: &Settings) -> Self {
        let mut routes = HashMap::new();

        for form in registry.iter() {
            let credentials: Option<&TenantCredentials> = match form.tenant {
                Tenant::Primary => Some(&settings.primary),
                Tenant::Secondary => settings.secondary.as_ref(),
            };

            let Some(credentials) = credentials else {
                warn!(
                    "{} ({}) needs the {:?} tenant, which is not configured; it will be rejected",
                    form.form_id, form.name, form.tenant
                );
                continue;
            };

            for (variant, model_id) in [
                (ModelVariant::Extraction, &form.models.extraction),
                (ModelVariant::Signature, &form.models.signature),
            ] {
                routes.insert(
                    (form.form_id, variant),
                    ModelRoute {
                        endpoint: credentials.endpoint.trim_end_matches('/').to_string(),
                        api_key: credentials.api_key.clone(),
                        model_id: model_id.clone(),
                    },
                );
            }
        }

        info!("Routing table built: {} model routes", routes.len());
        Self { routes }
    }

    pub fn route(&self, form: FormId, variant: ModelVariant) -> Option<&ModelRoute> {
        self.routes.get(&(form, variant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secondary_tenant_for_voter_roster() {
        let registry = FormRegistry::builtin().unwrap();
        let settings = Settings::for_tests("secret");
        let table = RoutingTable::build(&registry, &settings);

        let route = table
            .route(FormId::VoterRoster, ModelVariant::Extraction)
            .unwrap();
        assert_eq!(route.endpoint, "https://secondary.example.test");
        assert_eq!(route.api_key, "secondary-key");
        assert_eq!(route.model_id, "voter_neural");

        let route = table
            .route(FormId::AccountOpening, ModelVariant::Signature)
            .unwrap();
        assert_eq!(route.endpoint, "https://primary.example.test");
        assert_eq!(route.model_id, "Form2_Template");
    }

    #[test]
    fn test_missing_secondary_tenant_leaves_form_unroutable() {
        let registry = FormRegistry::builtin().unwrap();
        let mut settings = Settings::for_tests("secret");
        settings.secondary = None;
        let table = RoutingTable::build(&registry, &settings);

        assert!(table.route(FormId::VoterRoster, ModelVariant::Extraction).is_none());
        assert!(table.route(FormId::VoterRoster, ModelVariant::Signature).is_none());
        assert!(table.route(FormId::ChannelRequest, ModelVariant::Extraction).is_some());
    }
}
