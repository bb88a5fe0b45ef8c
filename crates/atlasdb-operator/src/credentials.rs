//! Superuser credentials and the connection info derived from them.
//!
//! The superuser secret is generated exactly once per cluster. An existing
//! secret is authoritative and is never rewritten, even when its content
//! looks wrong: clients may already hold the password. The connection-info
//! secret is a projection of the credential and the client Service and is
//! re-derived on every reconciliation.

use crate::error::{OperatorError, Result};
use crate::naming::{DEFAULT_DATABASE, POSTGRES_PORT};
use crate::resources::ResourceBuilder;
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Length of generated superuser passwords
pub const PASSWORD_LENGTH: usize = 32;

/// Generate a random alphanumeric password from the OS entropy source
pub fn generate_password(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Read a UTF-8 value out of a secret's `data`
pub fn secret_value(secret: &Secret, key: &str) -> Result<String> {
    let missing = || OperatorError::MissingSecretKey {
        name: secret.name_any(),
        namespace: secret.namespace().unwrap_or_default(),
        key: key.to_string(),
    };

    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|b| b.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|s| s.clone().into_bytes())
        })
        .ok_or_else(missing)?;

    String::from_utf8(bytes).map_err(|_| {
        OperatorError::InvalidConfig(format!(
            "secret {} key '{}' is not valid UTF-8",
            secret.name_any(),
            key
        ))
    })
}

/// Return the cluster's superuser secret, creating it on first use
#[instrument(skip(store, builder), fields(secret = %builder.names().superuser_secret()))]
pub async fn ensure_credential<S: ObjectStore>(
    store: &S,
    builder: &ResourceBuilder<'_>,
) -> Result<Secret> {
    let names = builder.names();
    let name = names.superuser_secret();

    if let Some(existing) = store.get::<Secret>(names.namespace(), &name).await? {
        debug!("Superuser secret already exists");
        return Ok(existing);
    }

    info!(namespace = %names.namespace(), "Generating superuser credentials");
    let desired = builder.build_superuser_secret(&generate_password(PASSWORD_LENGTH));
    store.create(&desired).await
}

/// Everything a client needs to reach the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: i32,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl ConnectionInfo {
    /// Project a credential secret onto the given client host
    ///
    /// Fails if the credential has no username or password: serving a cluster
    /// without a valid password is worse than not publishing connection info.
    pub fn derive(credential: &Secret, host: &str) -> Result<Self> {
        Ok(Self {
            host: host.to_string(),
            port: POSTGRES_PORT,
            username: secret_value(credential, "username")?,
            password: secret_value(credential, "password")?,
            database: DEFAULT_DATABASE.to_string(),
        })
    }

    /// `postgresql://` connection URI
    pub fn uri(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }

    /// Secret payload: host, port, username, password, database, uri
    pub fn to_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        data.insert("host".to_string(), self.host.clone());
        data.insert("port".to_string(), self.port.to_string());
        data.insert("username".to_string(), self.username.clone());
        data.insert("password".to_string(), self.password.clone());
        data.insert("database".to_string(), self.database.clone());
        data.insert("uri".to_string(), self.uri());
        data
    }
}
