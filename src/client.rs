use std::sync::{Arc, Mutex};

use arrow::array::RecordBatch;

use crate::{
    feature_group_engine::{FeatureGroupEngine, InsertOptions, ValidationOptions, WriteResult},
    rest_client::RestClient,
    ClientConfig, Error, FeatureGroup, IngestionSession, Result, WriteOptions,
};

/// A client for the feature store of one project.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Examples
/// ```no_run
/// # use std::sync::Arc;
/// # use arrow::array::{ArrayRef, Int64Array, RecordBatch};
/// # use featurestore::{ClientConfig, WriteOptions};
/// let client = ClientConfig::from_api_key("api-key")
///     .project_id(119)
///     .to_client()?;
///
/// let mut fg = client.feature_group("transactions", Some(1))?;
/// fg.primary_key = vec!["id".to_owned()];
/// fg.online_enabled = true;
///
/// let batch = RecordBatch::try_from_iter([
///     ("id", Arc::new(Int64Array::from(vec![1, 2, 3])) as ArrayRef),
/// ])?;
/// let (job, _report) = client.insert(&mut fg, &batch, &WriteOptions::new())?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Client {
    engine: FeatureGroupEngine<RestClient>,
    feature_store_id: Mutex<Option<i64>>,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the configuration has no project id.
    /// - [`Error::InvalidBaseUrl`] if the base URL cannot be parsed.
    pub fn new(config: ClientConfig) -> Result<Client> {
        let project_id = config.project_id.ok_or_else(|| {
            Error::InvalidArgument("client configuration has no project id".to_owned())
        })?;
        let rest = RestClient::new(config.base_url, config.api_key, project_id)?;
        let engine =
            FeatureGroupEngine::new(Arc::new(rest)).with_external_client(!config.internal);
        Ok(Client {
            engine,
            feature_store_id: Mutex::new(config.feature_store_id),
        })
    }

    /// The engine behind this client, for writes needing options beyond the shortcuts of
    /// `Client`.
    pub fn engine(&self) -> &FeatureGroupEngine<RestClient> {
        &self.engine
    }

    /// A new, unregistered feature group in the client's feature store.
    pub fn feature_group(&self, name: &str, version: Option<i32>) -> Result<FeatureGroup> {
        let mut fg = FeatureGroup::new(self.feature_store_id()?, name, version);
        fg.project_id = self.engine.platform().project_id();
        Ok(fg)
    }

    /// Register `fg` and write `batch` into it. See [`FeatureGroupEngine::save`].
    pub fn save(
        &self,
        fg: &mut FeatureGroup,
        batch: &RecordBatch,
        options: &WriteOptions,
    ) -> Result<WriteResult> {
        self.engine
            .save(fg, batch, options, ValidationOptions::default())
    }

    /// Write `batch` into `fg`. See [`FeatureGroupEngine::insert`].
    pub fn insert(
        &self,
        fg: &mut FeatureGroup,
        batch: &RecordBatch,
        options: &WriteOptions,
    ) -> Result<WriteResult> {
        self.engine
            .insert(fg, batch, &InsertOptions::new(), options, None)
    }

    /// Write one part of a multi-part insert. `session` must come from
    /// [`IngestionSession::multi_part`] and be closed by the caller after the last part.
    pub fn insert_part(
        &self,
        fg: &mut FeatureGroup,
        batch: &RecordBatch,
        options: &WriteOptions,
        session: &mut IngestionSession,
    ) -> Result<WriteResult> {
        self.engine
            .insert(fg, batch, &InsertOptions::new(), options, Some(session))
    }

    fn feature_store_id(&self) -> Result<i64> {
        let mut cached = self
            .feature_store_id
            .lock()
            .map_err(|_| Error::FeatureStore("feature store id lock is poisoned".to_owned()))?;
        if let Some(id) = *cached {
            return Ok(id);
        }
        let id = self.engine.platform().project_feature_store_id()?;
        log::debug!(target: "featurestore", feature_store_id = id; "resolved project feature store");
        *cached = Some(id);
        Ok(id)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_is_required() {
        let err = Client::new(ClientConfig::from_api_key("key")).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn configured_feature_store_is_used() {
        let client = ClientConfig::from_api_key("key")
            .project_id(119)
            .feature_store_id(67)
            .to_client()
            .unwrap();

        let fg = client.feature_group("transactions", Some(2)).unwrap();
        assert_eq!(fg.feature_store_id, 67);
        assert_eq!(fg.project_id, 119);
        assert!(!fg.is_registered());
    }
}
