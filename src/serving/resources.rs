use std::marker::PhantomData;

use serde::{
    de::{self, DeserializeOwned},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_json::{Map, Value};

/// Default requested cores of a serving component.
pub const MIN_CORES: f64 = 0.2;
/// Default requested memory of a serving component, in MB.
pub const MIN_MEMORY: u32 = 32;
/// Lower bound of the default core limit.
pub const MAX_CORES: f64 = 2.0;
/// Lower bound of the default memory limit, in MB.
pub const MAX_MEMORY: u32 = 1024;
pub const GPUS: u32 = 0;

/// Cores, memory (MB) and GPUs allocated to one instance of a serving component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cores: f64,
    pub memory: u32,
    pub gpus: u32,
}

impl Resources {
    pub fn new(cores: f64, memory: u32, gpus: u32) -> Resources {
        Resources {
            cores,
            memory,
            gpus,
        }
    }
}

/// [`Resources`] with any field possibly left to its default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialResources {
    #[serde(default)]
    pub cores: Option<f64>,
    #[serde(default)]
    pub memory: Option<u32>,
    #[serde(default)]
    pub gpus: Option<u32>,
}

impl PartialResources {
    fn fill(self, cores: f64, memory: u32, gpus: u32) -> Resources {
        Resources {
            cores: self.cores.unwrap_or(cores),
            memory: self.memory.unwrap_or(memory),
            gpus: self.gpus.unwrap_or(gpus),
        }
    }
}

impl From<Resources> for PartialResources {
    fn from(value: Resources) -> Self {
        PartialResources {
            cores: Some(value.cores),
            memory: Some(value.memory),
            gpus: Some(value.gpus),
        }
    }
}

/// A component of a deployment whose resources can be configured.
pub trait Component {
    /// Key the resources are serialized under.
    const RESOURCES_KEY: &'static str;
    /// Key the number of instances is serialized under.
    const NUM_INSTANCES_KEY: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Predictor;

impl Component for Predictor {
    const RESOURCES_KEY: &'static str = "predictorResources";
    const NUM_INSTANCES_KEY: &'static str = "requestedInstances";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transformer;

impl Component for Transformer {
    const RESOURCES_KEY: &'static str = "transformerResources";
    const NUM_INSTANCES_KEY: &'static str = "requestedTransformerInstances";
}

/// Number of instances and per-instance resources of a serving component.
///
/// Missing requests default to [`MIN_CORES`], [`MIN_MEMORY`] and [`GPUS`]. Missing limits default
/// to the larger of the request and [`MAX_CORES`] or [`MAX_MEMORY`], and to the requested GPUs.
///
/// ```
/// # use featurestore::serving::{PartialResources, PredictorResources};
/// let resources = PredictorResources::new(
///     1,
///     Some(PartialResources { cores: Some(4.0), ..Default::default() }),
///     None,
/// );
/// assert_eq!(resources.requests.memory, 32);
/// assert_eq!(resources.limits.cores, 4.0);
/// assert_eq!(resources.limits.memory, 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentResources<C> {
    pub num_instances: u32,
    pub requests: Resources,
    pub limits: Resources,
    component: PhantomData<C>,
}

pub type PredictorResources = ComponentResources<Predictor>;
pub type TransformerResources = ComponentResources<Transformer>;

impl<C: Component> ComponentResources<C> {
    pub fn new(
        num_instances: u32,
        requests: Option<PartialResources>,
        limits: Option<PartialResources>,
    ) -> ComponentResources<C> {
        let requests = requests
            .unwrap_or_default()
            .fill(MIN_CORES, MIN_MEMORY, GPUS);
        let limits = limits.unwrap_or_default().fill(
            requests.cores.max(MAX_CORES),
            requests.memory.max(MAX_MEMORY),
            requests.gpus,
        );
        ComponentResources {
            num_instances,
            requests,
            limits,
            component: PhantomData,
        }
    }

    fn from_json(mut json: Map<String, Value>) -> Result<ComponentResources<C>, String> {
        let mut resources = match json
            .remove(C::RESOURCES_KEY)
            .or_else(|| json.remove("resources"))
        {
            Some(Value::Object(resources)) => resources,
            Some(Value::Null) | None => json.clone(),
            Some(other) => return Err(format!("resources must be an object, got {other}")),
        };

        let num_instances = json
            .remove(C::NUM_INSTANCES_KEY)
            .or_else(|| json.remove("numInstances"))
            .or_else(|| resources.remove(C::NUM_INSTANCES_KEY))
            .or_else(|| resources.remove("numInstances"));
        let num_instances = match num_instances {
            Some(value) => field(value)?,
            None => return Err(format!("missing field `{}`", C::NUM_INSTANCES_KEY)),
        };

        let requests = optional_field(resources.remove("requests"))?;
        let limits = optional_field(resources.remove("limits"))?;
        Ok(ComponentResources::new(num_instances, requests, limits))
    }
}

fn field<T: DeserializeOwned>(value: Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|err| err.to_string())
}

fn optional_field<T: DeserializeOwned>(value: Option<Value>) -> Result<Option<T>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => field(value).map(Some),
    }
}

#[derive(Serialize)]
struct RequestsAndLimits<'a> {
    requests: &'a Resources,
    limits: &'a Resources,
}

impl<C: Component> Serialize for ComponentResources<C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(C::NUM_INSTANCES_KEY, &self.num_instances)?;
        map.serialize_entry(
            C::RESOURCES_KEY,
            &RequestsAndLimits {
                requests: &self.requests,
                limits: &self.limits,
            },
        )?;
        map.end()
    }
}

impl<'de, C: Component> Deserialize<'de> for ComponentResources<C> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = Map::deserialize(deserializer)?;
        ComponentResources::from_json(json).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let resources = TransformerResources::new(
            2,
            Some(PartialResources {
                memory: Some(2048),
                gpus: Some(1),
                ..Default::default()
            }),
            Some(PartialResources {
                cores: Some(1.0),
                ..Default::default()
            }),
        );

        assert_eq!(resources.requests, Resources::new(MIN_CORES, 2048, 1));
        assert_eq!(resources.limits, Resources::new(1.0, 2048, 1));
    }

    #[test]
    fn serializes_under_component_keys() {
        let predictor = PredictorResources::new(1, None, None);
        assert_eq!(
            serde_json::to_value(predictor).unwrap(),
            json!({
                "requestedInstances": 1,
                "predictorResources": {
                    "requests": {"cores": 0.2, "memory": 32, "gpus": 0},
                    "limits": {"cores": 2.0, "memory": 1024, "gpus": 0},
                }
            })
        );

        let transformer = TransformerResources::new(0, None, None);
        let value = serde_json::to_value(transformer).unwrap();
        assert_eq!(value["requestedTransformerInstances"], 0);
        assert!(value["transformerResources"]["limits"].is_object());
    }

    #[test]
    fn deserializes_every_layout() {
        let nested: PredictorResources = serde_json::from_value(json!({
            "requestedInstances": 3,
            "predictorResources": {"requests": {"cores": 1.0, "memory": 512, "gpus": 0}},
        }))
        .unwrap();
        assert_eq!(nested.num_instances, 3);
        assert_eq!(nested.requests.memory, 512);
        assert_eq!(nested.limits.memory, MAX_MEMORY);

        let generic: PredictorResources = serde_json::from_value(json!({
            "numInstances": 1,
            "resources": {"limits": {"cores": 8.0}},
        }))
        .unwrap();
        assert_eq!(generic.limits.cores, 8.0);
        assert_eq!(generic.limits.memory, MAX_MEMORY);

        let flat: TransformerResources = serde_json::from_value(json!({
            "requestedTransformerInstances": 1,
            "requests": {"cores": 0.5},
        }))
        .unwrap();
        assert_eq!(flat.requests.cores, 0.5);
        assert_eq!(flat.requests.memory, MIN_MEMORY);

        let inner: TransformerResources = serde_json::from_value(json!({
            "transformerResources": {"numInstances": 2},
        }))
        .unwrap();
        assert_eq!(inner.num_instances, 2);
    }

    #[test]
    fn missing_instances_are_rejected() {
        let err = serde_json::from_value::<PredictorResources>(json!({"resources": {}}));
        assert!(err.is_err());
    }
}
