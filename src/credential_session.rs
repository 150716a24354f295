use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::identity_provider::{BrokerKeys, IdentityProvider, PasswordAuth};
use crate::srp;

/// Provider tokens plus broker keys from one completed authentication flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub id_token: String,
    pub refresh_token: String,
    pub device_key: String,
    pub device_group_key: String,
    pub access_key: String,
    pub secret_key: String,
    pub session_token: String,
    pub expires_in: i64,
    pub identity_id: String,
    pub user_id: String,
}

impl Credential {
    pub fn broker_keys(&self) -> BrokerKeys {
        BrokerKeys {
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            session_token: self.session_token.clone(),
        }
    }
}

/// What a failed device registration does to the surrounding flow.
///
/// The provider may reject re-registering a device it already knows, so the
/// default keeps going and logs the rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceRegistrationPolicy {
    #[default]
    BestEffort,
    Required,
}

/// Username, password and app client identifiers for the flow
#[derive(Debug, Clone)]
pub struct LoginDetails {
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Owns the authentication flow and the live [`Credential`].
///
/// A flow builds a complete credential before swapping it in; a failed flow
/// leaves the previous credential in effect.
pub struct CredentialSession {
    provider: Arc<dyn IdentityProvider>,
    login: LoginDetails,
    registration_policy: DeviceRegistrationPolicy,
    current: RwLock<Option<Arc<Credential>>>,
    flow: Mutex<()>,
}

impl CredentialSession {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        login: LoginDetails,
        registration_policy: DeviceRegistrationPolicy,
    ) -> Self {
        Self {
            provider,
            login,
            registration_policy,
            current: RwLock::new(None),
            flow: Mutex::new(()),
        }
    }

    /// The credential from the last successful flow
    pub fn current(&self) -> Option<Arc<Credential>> {
        self.current.read().clone()
    }

    /// Runs the two-pass flow and replaces the live credential on success.
    ///
    /// The first pass only yields an alias username; the provider's stable
    /// user id is resolved mid-flow and the second pass binds the device
    /// registration to it. Only the second pass's credential is kept.
    pub async fn authenticate(&self) -> Result<Arc<Credential>, AuthError> {
        let _flow = self.flow.lock().await;
        info!(username = %self.login.username, "authenticating with identity provider");

        let first = self.sign_in(&self.login.username).await?;
        // first-pass keys are superseded by the second pass
        self.federate(&first).await?;

        let user_id = self.provider.get_user(&first.access_token).await?;
        debug!(user_id = %user_id, "resolved stable user id");
        self.provider.revoke(&first.refresh_token).await?;

        let second = self.sign_in(&user_id).await?;
        let (identity_id, keys) = self.federate(&second).await?;

        let credential = Arc::new(Credential {
            access_token: second.access_token,
            id_token: second.id_token,
            refresh_token: second.refresh_token,
            device_key: second.device_key,
            device_group_key: second.device_group_key,
            access_key: keys.access_key,
            secret_key: keys.secret_key,
            session_token: keys.session_token,
            expires_in: second.expires_in,
            identity_id,
            user_id,
        });

        *self.current.write() = Some(credential.clone());
        info!(
            identity_id = %credential.identity_id,
            expires_in = credential.expires_in,
            "credential refreshed"
        );
        Ok(credential)
    }

    /// Password authentication followed by device registration
    async fn sign_in(&self, username: &str) -> Result<PasswordAuth, AuthError> {
        let secret_hash = srp::secret_hash(username, &self.login.client_id, &self.login.client_secret);
        let auth = self
            .provider
            .initiate_password_auth(username, &self.login.password, &secret_hash)
            .await?;

        let verifier = srp::device_verifier(
            &auth.device_group_key,
            &auth.device_key,
            &srp::random_device_password(),
        )?;
        match self
            .provider
            .register_device(&auth.access_token, &auth.device_key, &verifier)
            .await
        {
            Ok(()) => debug!(device_key = %auth.device_key, "device registered"),
            Err(e) if self.registration_policy == DeviceRegistrationPolicy::BestEffort => {
                warn!(device_key = %auth.device_key, error = %e, "device registration rejected, continuing");
            }
            Err(e) => return Err(e),
        }

        Ok(auth)
    }

    /// Exchanges the id token for a federated identity and its broker keys
    async fn federate(&self, auth: &PasswordAuth) -> Result<(String, BrokerKeys), AuthError> {
        let identity_id = self.provider.exchange_for_identity(&auth.id_token).await?;
        let keys = self
            .provider
            .get_credentials_for_identity(&identity_id, &auth.id_token)
            .await?;
        Ok((identity_id, keys))
    }
}
