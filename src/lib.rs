//! EDP Solar Bridge Library
//!
//! Keeps an authenticated real-time telemetry stream open against the EDP
//! cloud broker and turns the power samples of the account's meters into
//! running energy totals that observers can read at any time.

pub mod broker;
pub mod config;
pub mod credential_session;
pub mod device_registry;
pub mod directory;
pub mod energy_integrator;
pub mod error;
pub mod identity_provider;
pub mod session_coordinator;
pub mod sigv4;
pub mod srp;
pub mod streaming_client;
pub mod telemetry_aggregator;

// Re-export commonly used types for easier access
pub use broker::{Broker, BrokerEvents, MqttBroker};
pub use config::Settings;
pub use credential_session::{Credential, CredentialSession};
pub use device_registry::{Device, Role};
pub use directory::DirectoryClient;
pub use energy_integrator::EnergyIntegrator;
pub use identity_provider::{CognitoProvider, IdentityProvider};
pub use session_coordinator::{SessionCoordinator, WorkerCommand};
pub use streaming_client::StreamingClient;
pub use telemetry_aggregator::{Channel, TelemetryAggregator, TelemetrySnapshot};
