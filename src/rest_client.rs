//! A blocking HTTP client for the platform's REST API.
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rand::{thread_rng, Rng};
use reqwest::{
    blocking::{RequestBuilder, Response},
    header::AUTHORIZATION,
    StatusCode, Url,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use featurestore_core::{
    collaborators::{
        Commit, Execution, FeatureGroupApi, FeatureGroupMetadata, IngestionJob, Job,
        KafkaConfigResolver, MaterializationJob, MetadataUpdate, OnlineIngestion,
        OnlineIngestionApi,
    },
    Error, FeatureGroup, Result,
};

const JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);
const JOB_POLL_JITTER: Duration = Duration::from_secs(1);

/// Execution states after which a job no longer runs.
const FINAL_EXECUTION_STATES: &[&str] = &[
    "FINISHED",
    "FAILED",
    "KILLED",
    "FRAMEWORK_FAILURE",
    "APP_MASTER_START_FAILED",
    "INITIALIZATION_FAILED",
];

/// Implements the platform collaborator traits over HTTP.
pub struct RestClient {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    project_id: i64,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Items<T> {
    #[serde(default)]
    items: Vec<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OptionDto<'a> {
    name: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestionJobConf<'a> {
    data_format: &'static str,
    data_options: Vec<OptionDto<'a>>,
    write_options: Vec<OptionDto<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KafkaConnector {
    bootstrap_servers: String,
    #[serde(default)]
    security_protocol: Option<String>,
    #[serde(default)]
    ssl_endpoint_identification_algorithm: Option<String>,
    #[serde(default)]
    options: Vec<ConnectorOption>,
}

#[derive(Debug, Deserialize)]
struct ConnectorOption {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleDto<'a> {
    cron_expression: &'a str,
    start_date_time: i64,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureStoreDto {
    featurestore_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OnlineIngestionRequest {
    num_entries: Option<i64>,
}

impl KafkaConnector {
    /// librdkafka client properties of the connector.
    fn into_properties(self) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        properties.insert("bootstrap.servers".to_owned(), self.bootstrap_servers);
        if let Some(protocol) = self.security_protocol {
            properties.insert("security.protocol".to_owned(), protocol);
        }
        if let Some(algorithm) = self.ssl_endpoint_identification_algorithm {
            // HTTPS is the only algorithm librdkafka knows, anything else disables the check.
            let algorithm = if algorithm.eq_ignore_ascii_case("https") {
                "https"
            } else {
                "none"
            };
            properties.insert(
                "ssl.endpoint.identification.algorithm".to_owned(),
                algorithm.to_owned(),
            );
        }
        for option in self.options {
            properties.insert(option.name, option.value);
        }
        properties
    }
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        project_id: i64,
    ) -> Result<RestClient> {
        let base_url = base_url.into();
        Url::parse(&base_url).map_err(Error::InvalidBaseUrl)?;

        Ok(RestClient {
            client: reqwest::blocking::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            project_id,
            unauthorized: AtomicBool::new(false),
        })
    }

    pub fn project_id(&self) -> i64 {
        self.project_id
    }

    /// Id of the project's own feature store, the first one the project has access to.
    pub fn project_feature_store_id(&self) -> Result<i64> {
        let stores: Vec<FeatureStoreDto> = self.get_json("/featurestores", &[])?;
        stores
            .first()
            .map(|store| store.featurestore_id)
            .ok_or_else(|| {
                Error::FeatureStore(format!("project {} has no feature store", self.project_id))
            })
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let url = format!("{}/project/{}{}", self.base_url, self.project_id, path);
        let parsed = if query.is_empty() {
            Url::parse(&url)
        } else {
            Url::parse_with_params(&url, query)
        };
        parsed.map_err(Error::InvalidBaseUrl)
    }

    fn feature_group_path(fg: &FeatureGroup) -> Result<String> {
        let id = fg.id.ok_or_else(|| {
            Error::InvalidArgument(format!("feature group '{}' is not registered", fg.name))
        })?;
        Ok(format!(
            "/featurestores/{}/featuregroups/{id}",
            fg.feature_store_id
        ))
    }

    fn send(&self, request: RequestBuilder) -> Result<Response> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let response = request
            .header(AUTHORIZATION, format!("ApiKey {}", self.api_key))
            .send()?;

        response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "featurestore", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            } else {
                log::warn!(target: "featurestore", "received non-200 response: {:?}", err);
                Error::from(err)
            }
        })
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.url(path, query)?;
        log::debug!(target: "featurestore", url = url.as_str(); "GET");
        Ok(self.send(self.client.get(url))?.json()?)
    }

    fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> Result<T> {
        let url = self.url(path, query)?;
        log::debug!(target: "featurestore", url = url.as_str(); "POST");
        Ok(self.send(self.client.post(url).json(body))?.json()?)
    }

    fn execution(&self, job: &Job, id: i64) -> Result<Execution> {
        self.get_json(&format!("/jobs/{}/executions/{id}", job.name), &[])
    }

    fn await_execution(&self, job: &Job, mut execution: Execution) -> Result<Execution> {
        while !FINAL_EXECUTION_STATES.contains(&execution.state.as_str()) {
            let jitter = thread_rng().gen_range(Duration::ZERO..=JOB_POLL_JITTER);
            std::thread::sleep(JOB_POLL_INTERVAL + jitter);
            execution = self.execution(job, execution.id)?;
            log::debug!(target: "featurestore",
                job = job.name.as_str(), execution = execution.id, state = execution.state.as_str();
                "waiting for job");
        }

        if execution.state == "FINISHED" {
            Ok(execution)
        } else {
            Err(Error::FeatureStore(format!(
                "job '{}' execution {} ended in state {}",
                job.name, execution.id, execution.state
            )))
        }
    }
}

impl FeatureGroupApi for RestClient {
    fn save(&self, fg: &FeatureGroup) -> Result<FeatureGroupMetadata> {
        self.post_json(
            &format!("/featurestores/{}/featuregroups", fg.feature_store_id),
            &[],
            &FeatureGroupMetadata::from(fg),
        )
    }

    fn update_metadata(
        &self,
        fg: &FeatureGroup,
        update: MetadataUpdate,
    ) -> Result<FeatureGroupMetadata> {
        let query = match update {
            MetadataUpdate::Metadata => vec![("updateMetadata", "true".to_owned())],
            MetadataUpdate::Deprecate(deprecate) => vec![("deprecate", deprecate.to_string())],
        };
        let url = self.url(&Self::feature_group_path(fg)?, &query)?;
        log::debug!(target: "featurestore", url = url.as_str(); "PUT");
        Ok(self
            .send(self.client.put(url).json(&FeatureGroupMetadata::from(fg)))?
            .json()?)
    }

    fn delete_content(&self, fg: &FeatureGroup) -> Result<()> {
        let url = self.url(&format!("{}/clear", Self::feature_group_path(fg)?), &[])?;
        self.send(self.client.post(url))?;
        Ok(())
    }

    fn commit_details(
        &self,
        fg: &FeatureGroup,
        wallclock_time: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Commit>> {
        let mut query = vec![("sort_by", "committed_on:desc".to_owned()), ("offset", "0".to_owned())];
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(wallclock_time) = wallclock_time {
            query.push(("filter_by", format!("commited_on_ltoeq:{wallclock_time}")));
        }
        let commits: Items<Commit> =
            self.get_json(&format!("{}/commits", Self::feature_group_path(fg)?), &query)?;
        Ok(commits.items)
    }

    fn ingestion_job(
        &self,
        fg: &FeatureGroup,
        write_options: &BTreeMap<String, String>,
    ) -> Result<IngestionJob> {
        let conf = IngestionJobConf {
            data_format: "PARQUET",
            data_options: Vec::new(),
            write_options: write_options
                .iter()
                .map(|(name, value)| OptionDto { name, value })
                .collect(),
        };
        self.post_json(
            &format!("{}/ingestion", Self::feature_group_path(fg)?),
            &[],
            &conf,
        )
    }

    fn upload(&self, content: Vec<u8>, remote_path: &str) -> Result<()> {
        let url = self.url(
            &format!("/dataset/upload/{}", remote_path.trim_start_matches('/')),
            &[],
        )?;
        log::debug!(target: "featurestore", url = url.as_str(), bytes = content.len(); "uploading file");
        self.send(
            self.client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(content),
        )?;
        Ok(())
    }
}

impl KafkaConfigResolver for RestClient {
    fn kafka_config(
        &self,
        feature_store_id: i64,
        external: bool,
    ) -> Result<BTreeMap<String, String>> {
        let connector: KafkaConnector = self.get_json(
            &format!("/featurestores/{feature_store_id}/storageconnectors/kafka_connector/byFeaturestore"),
            &[("external", external.to_string())],
        )?;
        Ok(connector.into_properties())
    }
}

impl MaterializationJob for RestClient {
    fn run(&self, job: &Job, args: &str, await_termination: bool) -> Result<Execution> {
        let url = self.url(&format!("/jobs/{}/executions", job.name), &[])?;
        let execution: Execution = self
            .send(
                self.client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "text/plain")
                    .body(args.to_owned()),
            )?
            .json()?;
        log::info!(target: "featurestore",
            job = job.name.as_str(), execution = execution.id;
            "launched job");

        if await_termination {
            self.await_execution(job, execution)
        } else {
            Ok(execution)
        }
    }

    fn schedule(
        &self,
        job: &Job,
        cron_expression: &str,
        start_time: DateTime<Utc>,
    ) -> Result<()> {
        let _: serde_json::Value = self.post_json(
            &format!("/jobs/{}/schedule/v2", job.name),
            &[],
            &ScheduleDto {
                cron_expression,
                start_date_time: start_time.timestamp_millis(),
                enabled: true,
            },
        )?;
        Ok(())
    }

    fn last_execution(&self, job: &Job) -> Result<Option<Execution>> {
        let executions: Items<Execution> = self.get_json(
            &format!("/jobs/{}/executions", job.name),
            &[
                ("sort_by", "submissiontime:desc".to_owned()),
                ("offset", "0".to_owned()),
                ("limit", "1".to_owned()),
            ],
        )?;
        Ok(executions.items.into_iter().next())
    }
}

impl OnlineIngestionApi for RestClient {
    fn create(&self, fg: &FeatureGroup, num_entries: Option<i64>) -> Result<OnlineIngestion> {
        self.post_json(
            &format!("{}/online_ingestion", Self::feature_group_path(fg)?),
            &[],
            &OnlineIngestionRequest { num_entries },
        )
    }

    fn latest(&self, fg: &FeatureGroup) -> Result<Option<OnlineIngestion>> {
        let ingestions: Items<OnlineIngestion> = self.get_json(
            &format!("{}/online_ingestion", Self::feature_group_path(fg)?),
            &[
                ("sort_by", "ID:desc".to_owned()),
                ("offset", "0".to_owned()),
                ("limit", "1".to_owned()),
            ],
        )?;
        Ok(ingestions.items.into_iter().next())
    }

    fn get(&self, fg: &FeatureGroup, id: i64) -> Result<OnlineIngestion> {
        self.get_json(
            &format!("{}/online_ingestion/{id}", Self::feature_group_path(fg)?),
            &[],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(
            RestClient::new("not a url", "key", 1),
            Err(Error::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn urls_are_scoped_to_the_project() {
        let client = RestClient::new("https://cluster.ai/hopsworks-api/api/", "key", 119).unwrap();
        let mut fg = FeatureGroup::new(67, "fg", Some(1));
        fg.id = Some(13);

        let url = client
            .url(&RestClient::feature_group_path(&fg).unwrap(), &[("limit", "1".to_owned())])
            .unwrap();

        assert_eq!(
            url.as_str(),
            "https://cluster.ai/hopsworks-api/api/project/119/featurestores/67/featuregroups/13?limit=1"
        );
    }

    #[test]
    fn unregistered_feature_group_has_no_path() {
        let fg = FeatureGroup::new(67, "fg", Some(1));
        assert!(RestClient::feature_group_path(&fg).is_err());
    }

    #[test]
    fn connector_properties() {
        let connector: KafkaConnector = serde_json::from_value(serde_json::json!({
            "bootstrapServers": "broker:9091",
            "securityProtocol": "SSL",
            "sslEndpointIdentificationAlgorithm": "",
            "options": [{"name": "linger.ms", "value": "5"}],
        }))
        .unwrap();

        let properties = connector.into_properties();

        assert_eq!(properties["bootstrap.servers"], "broker:9091");
        assert_eq!(properties["security.protocol"], "SSL");
        assert_eq!(properties["ssl.endpoint.identification.algorithm"], "none");
        assert_eq!(properties["linger.ms"], "5");
    }
}
