use crate::{Client, Result};

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use featurestore::ClientConfig;
/// let client = ClientConfig::from_api_key("api-key")
///     .project_id(119)
///     .to_client();
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) project_id: Option<i64>,
    pub(crate) feature_store_id: Option<i64>,
    pub(crate) internal: bool,
}

impl ClientConfig {
    /// Create a default configuration using the specified API key.
    ///
    /// ```
    /// # use featurestore::ClientConfig;
    /// ClientConfig::from_api_key("api-key");
    /// ```
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        ClientConfig {
            api_key: api_key.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            project_id: None,
            feature_store_id: None,
            internal: false,
        }
    }

    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = "https://c.app.hopsworks.ai/hopsworks-api/api";

    /// Override base URL for API calls, e.g. for a self-hosted cluster.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the base URL from a host name, e.g. `my.cluster.ai`.
    ///
    /// ```
    /// # use featurestore::ClientConfig;
    /// let config = ClientConfig::from_api_key("api-key").host("my.cluster.ai");
    /// ```
    pub fn host(self, host: &str) -> Self {
        self.base_url(format!("https://{host}/hopsworks-api/api"))
    }

    /// Project whose feature store is used.
    pub fn project_id(mut self, project_id: i64) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Feature store new feature groups are created in. Defaults to the project's own feature
    /// store, whose id is looked up on first use.
    pub fn feature_store_id(mut self, feature_store_id: i64) -> Self {
        self.feature_store_id = Some(feature_store_id);
        self
    }

    /// Mark the client as running inside the platform, so that internal broker listeners are
    /// used.
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use featurestore::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_api_key("api-key")
    ///     .project_id(119)
    ///     .to_client()
    ///     .unwrap();
    /// ```
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}
