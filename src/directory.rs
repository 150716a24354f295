use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use crate::device_registry::{self, Device};
use crate::error::DiscoveryError;

/// Equipment directory of the monitoring cloud: houses, devices, modules
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    endpoint_url: String,
    client: reqwest::Client,
}

/// Outcome of one discovery cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    pub house_id: String,
    pub devices: Vec<Device>,
}

impl DirectoryClient {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn list_houses(&self, id_token: &str) -> Result<Vec<House>, DiscoveryError> {
        let response: HouseList = self.get("/equipment/houses", id_token).await?;
        Ok(response.houses)
    }

    pub async fn list_devices(
        &self,
        id_token: &str,
        house_id: &str,
    ) -> Result<Vec<DeviceRecord>, DiscoveryError> {
        self.get(&format!("/equipment/houses/{house_id}/device"), id_token)
            .await
    }

    pub async fn list_modules(
        &self,
        id_token: &str,
        house_id: &str,
    ) -> Result<Vec<ModuleRecord>, DiscoveryError> {
        let response: ModuleList = self
            .get(&format!("/equipment/houses/{house_id}/modules"), id_token)
            .await?;
        Ok(response.modules)
    }

    /// Runs a full discovery cycle against the account's first house
    pub async fn discover(&self, id_token: &str) -> Result<Discovery, DiscoveryError> {
        let house_id = self
            .list_houses(id_token)
            .await?
            .into_iter()
            .next()
            .ok_or(DiscoveryError::NoHouse)?
            .house_id;

        let devices = self.list_devices(id_token, &house_id).await?;
        let modules = self.list_modules(id_token, &house_id).await?;
        let devices = device_registry::classify(&devices, &modules);
        debug!(house_id = %house_id, devices = ?devices, "discovered devices");

        Ok(Discovery { house_id, devices })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, id_token: &str) -> Result<T, DiscoveryError> {
        let response = self
            .client
            .get(format!("{}{}", self.endpoint_url, path))
            .header(reqwest::header::AUTHORIZATION, id_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Status {
                status: response.status().as_u16(),
                path: path.to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
struct HouseList {
    houses: Vec<House>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct House {
    pub house_id: String,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_local_id: String,
    #[serde(rename = "type")]
    pub device_type: String,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ModuleList {
    #[serde(rename = "Modules")]
    modules: Vec<ModuleRecord>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRecord {
    pub device_id: String,
    #[serde(default)]
    pub groups: Vec<String>,
    pub connectivity_state: Option<String>,
    pub serial_number: Option<String>,
}
