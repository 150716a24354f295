use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::Deserialize;
use serde_json::json;

use crate::error::AuthError;
use crate::srp::DeviceVerifier;

/// Tokens and device identity returned by a password authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordAuth {
    pub access_token: String,
    pub id_token: String,
    pub refresh_token: String,
    pub device_key: String,
    pub device_group_key: String,
    pub expires_in: i64,
}

/// Short-lived keys authorising the broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerKeys {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: String,
}

/// Operations consumed from the identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn initiate_password_auth(
        &self,
        username: &str,
        password: &str,
        secret_hash: &str,
    ) -> Result<PasswordAuth, AuthError>;

    async fn register_device(
        &self,
        access_token: &str,
        device_key: &str,
        verifier: &DeviceVerifier,
    ) -> Result<(), AuthError>;

    async fn exchange_for_identity(&self, id_token: &str) -> Result<String, AuthError>;

    async fn get_credentials_for_identity(
        &self,
        identity_id: &str,
        id_token: &str,
    ) -> Result<BrokerKeys, AuthError>;

    async fn get_user(&self, access_token: &str) -> Result<String, AuthError>;

    async fn revoke(&self, refresh_token: &str) -> Result<(), AuthError>;
}

/// Static identifiers of the app client, user pool and identity pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub region: String,
    pub client_id: String,
    pub client_secret: String,
    pub user_pool_id: String,
    pub identity_pool_id: String,
    pub user_pool_url: String,
    pub identity_url: String,
    pub device_name: String,
}

impl ProviderSettings {
    /// Key under which the user pool's id token is presented to the identity pool
    fn login_key(&self) -> String {
        format!(
            "cognito-idp.{}.amazonaws.com/{}",
            self.region, self.user_pool_id
        )
    }
}

/// JSON-over-HTTP client for the user pool and identity pool services
pub struct CognitoProvider {
    settings: ProviderSettings,
    client: reqwest::Client,
}

const USER_POOL_TARGET: &str = "AWSCognitoIdentityProviderService";
const IDENTITY_TARGET: &str = "AWSCognitoIdentityService";

impl CognitoProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    async fn call<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: &str,
        target: &str,
        operation: &'static str,
        body: &B,
    ) -> Result<T, AuthError> {
        let response = self
            .client
            .post(url)
            .header("X-Amz-Target", format!("{target}.{operation}"))
            .header(reqwest::header::CONTENT_TYPE, "application/x-amz-json-1.1")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error: ProviderErrorBody = response.json().await.unwrap_or_default();
            return Err(AuthError::Provider {
                operation,
                kind: error.kind.unwrap_or_else(|| status.to_string()),
                message: error.message.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    async fn user_pool<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        body: serde_json::Value,
    ) -> Result<T, AuthError> {
        self.call(&self.settings.user_pool_url, USER_POOL_TARGET, operation, &body)
            .await
    }

    async fn identity<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        body: serde_json::Value,
    ) -> Result<T, AuthError> {
        self.call(&self.settings.identity_url, IDENTITY_TARGET, operation, &body)
            .await
    }

    fn logins(&self, id_token: &str) -> HashMap<String, String> {
        HashMap::from([(self.settings.login_key(), id_token.to_string())])
    }
}

#[async_trait]
impl IdentityProvider for CognitoProvider {
    async fn initiate_password_auth(
        &self,
        username: &str,
        password: &str,
        secret_hash: &str,
    ) -> Result<PasswordAuth, AuthError> {
        let response: InitiateAuthResponse = self
            .user_pool(
                "InitiateAuth",
                json!({
                    "AuthFlow": "USER_PASSWORD_AUTH",
                    "ClientId": self.settings.client_id,
                    "AuthParameters": {
                        "USERNAME": username,
                        "PASSWORD": password,
                        "SECRET_HASH": secret_hash,
                    },
                }),
            )
            .await?;

        let result = response
            .authentication_result
            .ok_or(AuthError::MissingField("AuthenticationResult"))?;
        let device = result
            .new_device_metadata
            .ok_or(AuthError::MissingField("NewDeviceMetadata"))?;

        Ok(PasswordAuth {
            access_token: result.access_token,
            id_token: result.id_token,
            refresh_token: result
                .refresh_token
                .ok_or(AuthError::MissingField("RefreshToken"))?,
            device_key: device.device_key,
            device_group_key: device.device_group_key,
            expires_in: result.expires_in,
        })
    }

    async fn register_device(
        &self,
        access_token: &str,
        device_key: &str,
        verifier: &DeviceVerifier,
    ) -> Result<(), AuthError> {
        let _: serde_json::Value = self
            .user_pool(
                "ConfirmDevice",
                json!({
                    "AccessToken": access_token,
                    "DeviceKey": device_key,
                    "DeviceName": self.settings.device_name,
                    "DeviceSecretVerifierConfig": {
                        "PasswordVerifier": verifier.password_verifier,
                        "Salt": verifier.salt,
                    },
                }),
            )
            .await?;
        Ok(())
    }

    async fn exchange_for_identity(&self, id_token: &str) -> Result<String, AuthError> {
        let response: GetIdResponse = self
            .identity(
                "GetId",
                json!({
                    "IdentityPoolId": self.settings.identity_pool_id,
                    "Logins": self.logins(id_token),
                }),
            )
            .await?;
        Ok(response.identity_id)
    }

    async fn get_credentials_for_identity(
        &self,
        identity_id: &str,
        id_token: &str,
    ) -> Result<BrokerKeys, AuthError> {
        let response: CredentialsResponse = self
            .identity(
                "GetCredentialsForIdentity",
                json!({
                    "IdentityId": identity_id,
                    "Logins": self.logins(id_token),
                }),
            )
            .await?;
        Ok(BrokerKeys {
            access_key: response.credentials.access_key_id,
            secret_key: response.credentials.secret_key,
            session_token: response.credentials.session_token,
        })
    }

    async fn get_user(&self, access_token: &str) -> Result<String, AuthError> {
        let response: GetUserResponse = self
            .user_pool("GetUser", json!({ "AccessToken": access_token }))
            .await?;
        Ok(response.username)
    }

    async fn revoke(&self, refresh_token: &str) -> Result<(), AuthError> {
        let _: serde_json::Value = self
            .user_pool(
                "RevokeToken",
                json!({
                    "Token": refresh_token,
                    "ClientId": self.settings.client_id,
                    "ClientSecret": self.settings.client_secret,
                }),
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProviderErrorBody {
    #[serde(rename = "__type")]
    kind: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuthResponse {
    authentication_result: Option<AuthenticationResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticationResult {
    access_token: String,
    id_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    new_device_metadata: Option<NewDeviceMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NewDeviceMetadata {
    device_key: String,
    device_group_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetIdResponse {
    identity_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialsResponse {
    credentials: IdentityCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdentityCredentials {
    access_key_id: String,
    secret_key: String,
    session_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetUserResponse {
    username: String,
}
