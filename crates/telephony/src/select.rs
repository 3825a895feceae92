//! Per-tenant provider selection and the lazily built instance cache.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::providers::exotel::{ExotelConfig, ExotelProvider};
use crate::providers::smartflo::{SmartfloConfig, SmartfloProvider};
use crate::{CallProvider, TelephonyError, PROVIDER_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Always the tenant's `active_provider`.
    Switch,
    /// Uniform over `enabled_providers`.
    Random,
    /// Weighted draw over `percentages`, in their listed order.
    Percentage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderWeight {
    pub provider: String,
    pub weight: f64,
}

/// Per-company telephony configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub company_id: String,
    pub enabled_providers: Vec<String>,
    pub selection_method: SelectionMethod,
    #[serde(default)]
    pub active_provider: Option<String>,
    #[serde(default)]
    pub fallback_provider: Option<String>,
    #[serde(default)]
    pub percentages: Vec<ProviderWeight>,
}

/// Pick a provider name for this tenant. `draw` is a uniform sample from
/// `[0, 100)`, injected for determinism in tests.
pub fn select_with_draw(tenant: &TenantConfig, draw: f64) -> Result<String, TelephonyError> {
    if tenant.enabled_providers.is_empty() {
        return Err(TelephonyError::Config(format!(
            "tenant {} has no enabled providers",
            tenant.company_id
        )));
    }

    let chosen = match tenant.selection_method {
        SelectionMethod::Switch => tenant.active_provider.clone().ok_or_else(|| {
            TelephonyError::Config(format!(
                "tenant {} uses switch selection but has no active provider",
                tenant.company_id
            ))
        })?,
        SelectionMethod::Random => {
            let index = ((draw / 100.0) * tenant.enabled_providers.len() as f64) as usize;
            tenant.enabled_providers[index.min(tenant.enabled_providers.len() - 1)].clone()
        }
        SelectionMethod::Percentage => {
            let mut cumulative = 0.0;
            let mut picked = None;
            for weight in &tenant.percentages {
                cumulative += weight.weight;
                if cumulative > draw {
                    picked = Some(weight.provider.clone());
                    break;
                }
            }
            // Weights not summing to 100 fall back to the first enabled.
            picked.unwrap_or_else(|| tenant.enabled_providers[0].clone())
        }
    };

    if tenant.enabled_providers.contains(&chosen) {
        return Ok(chosen);
    }
    match &tenant.fallback_provider {
        Some(fallback) if tenant.enabled_providers.contains(fallback) => Ok(fallback.clone()),
        _ => Err(TelephonyError::NotEnabled(chosen)),
    }
}

pub fn select_provider(tenant: &TenantConfig) -> Result<String, TelephonyError> {
    let draw = rand::rng().random_range(0.0..100.0);
    select_with_draw(tenant, draw)
}

/// Deployment-wide provider credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub exotel: Option<ExotelConfig>,
    #[serde(default)]
    pub smartflo: Option<SmartfloConfig>,
}

/// Builds and caches one provider instance per (company, provider). Provider
/// instances are immutable after construction and shared across calls.
pub struct ProviderDirectory {
    settings: ProviderSettings,
    http: reqwest::Client,
    instances: Mutex<HashMap<(String, String), Arc<dyn CallProvider>>>,
}

impl ProviderDirectory {
    pub fn new(settings: ProviderSettings) -> Result<Self, TelephonyError> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .map_err(|e| TelephonyError::Config(format!("http client: {e}")))?;
        Ok(Self {
            settings,
            http,
            instances: Mutex::new(HashMap::new()),
        })
    }

    /// The provider selected by the tenant's policy.
    pub async fn provider_for(
        &self,
        tenant: &TenantConfig,
    ) -> Result<Arc<dyn CallProvider>, TelephonyError> {
        let name = select_provider(tenant)?;
        self.named(&tenant.company_id, &name).await
    }

    /// A specific provider instance for a company, created lazily.
    pub async fn named(
        &self,
        company_id: &str,
        name: &str,
    ) -> Result<Arc<dyn CallProvider>, TelephonyError> {
        let key = (company_id.to_string(), name.to_string());
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get(&key) {
            return Ok(instance.clone());
        }
        let instance = self.build(name)?;
        debug!(company = company_id, provider = name, "provider instance created");
        instances.insert(key, instance.clone());
        Ok(instance)
    }

    fn build(&self, name: &str) -> Result<Arc<dyn CallProvider>, TelephonyError> {
        match name {
            "exotel" => {
                let config = self.settings.exotel.clone().ok_or_else(|| {
                    TelephonyError::Config("exotel credentials not configured".into())
                })?;
                Ok(Arc::new(ExotelProvider::new(self.http.clone(), config)))
            }
            "smartflo" => {
                let config = self.settings.smartflo.clone().ok_or_else(|| {
                    TelephonyError::Config("smartflo credentials not configured".into())
                })?;
                Ok(Arc::new(SmartfloProvider::new(self.http.clone(), config)))
            }
            other => Err(TelephonyError::UnknownProvider(other.to_string())),
        }
    }
}

pub(crate) fn join_url(base: &Url, path: &str) -> Result<Url, TelephonyError> {
    base.join(path)
        .map_err(|e| TelephonyError::Config(format!("bad provider url: {e}")))
}
