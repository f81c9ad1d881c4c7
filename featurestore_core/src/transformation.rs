//! Transformation functions and their application to a dataframe.
//!
//! A [`TransformationFunctionBinding`] ties a function to the features it reads and the columns it
//! produces. Bindings are applied in order with [`apply`]; later bindings see the output columns of
//! earlier ones.
use std::{collections::HashMap, fmt, sync::Arc};

use arrow::{
    array::{ArrayRef, RecordBatch, RecordBatchOptions},
    datatypes::{Field, Schema},
};
use serde::{Deserialize, Serialize};

use crate::{
    feature::arrow_type_from_offline,
    schema::cast_column,
    value::{build_array, FeatureValue},
    Error, Result,
};

/// Whether a transformation runs when rows are written or when features are read for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformationType {
    /// Computed at insertion time, outputs are stored in the feature group.
    OnDemand,
    /// Computed at retrieval time, e.g. when materializing training data.
    ModelDependent,
}

/// Free-form values made available to transformation functions, e.g. statistics or request
/// parameters.
pub type TransformationContext = HashMap<String, serde_json::Value>;

/// A function receiving one row's input values, in declared input order, and returning one value
/// per declared output.
pub type RowWiseFn = Arc<
    dyn Fn(&[FeatureValue], Option<&TransformationContext>) -> Result<Vec<FeatureValue>>
        + Send
        + Sync,
>;

/// A function receiving whole input columns and returning one column per declared output. Output
/// columns are aligned with the input by position.
pub type VectorizedFn =
    Arc<dyn Fn(&[ArrayRef], Option<&TransformationContext>) -> Result<Vec<ArrayRef>> + Send + Sync>;

#[derive(Clone)]
pub enum ExecutionMode {
    RowWise(RowWiseFn),
    Vectorized(VectorizedFn),
}

impl fmt::Debug for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::RowWise(_) => f.write_str("RowWise"),
            ExecutionMode::Vectorized(_) => f.write_str("Vectorized"),
        }
    }
}

/// An output column declared by a transformation function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationOutput {
    pub name: String,
    /// Offline feature type of the column, e.g. `double`.
    #[serde(rename = "type")]
    pub feature_type: String,
}

/// A transformation function attached to a feature group or a feature view.
#[derive(Debug, Clone)]
pub struct TransformationFunctionBinding {
    pub function_name: String,
    pub input_features: Vec<String>,
    pub outputs: Vec<TransformationOutput>,
    pub mode: ExecutionMode,
    /// Features removed from the dataframe once every binding has run.
    pub dropped_features: Vec<String>,
    pub transformation_type: TransformationType,
}

impl TransformationFunctionBinding {
    /// Create an on-demand binding executed once per row.
    ///
    /// # Example
    ///
    /// ```
    /// # use featurestore_core::{transformation::TransformationFunctionBinding, FeatureValue};
    /// let plus_one = TransformationFunctionBinding::row_wise(
    ///     "plus_one",
    ///     ["amount"],
    ///     [("amount_plus_one", "double")],
    ///     |values, _| Ok(vec![values[0].as_f64().map(|v| v + 1.0).into()]),
    /// );
    /// ```
    pub fn row_wise<F>(
        function_name: impl Into<String>,
        input_features: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
        function: F,
    ) -> TransformationFunctionBinding
    where
        F: Fn(&[FeatureValue], Option<&TransformationContext>) -> Result<Vec<FeatureValue>>
            + Send
            + Sync
            + 'static,
    {
        TransformationFunctionBinding::new(
            function_name,
            input_features,
            outputs,
            ExecutionMode::RowWise(Arc::new(function)),
        )
    }

    /// Create an on-demand binding executed once over whole columns.
    pub fn vectorized<F>(
        function_name: impl Into<String>,
        input_features: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
        function: F,
    ) -> TransformationFunctionBinding
    where
        F: Fn(&[ArrayRef], Option<&TransformationContext>) -> Result<Vec<ArrayRef>>
            + Send
            + Sync
            + 'static,
    {
        TransformationFunctionBinding::new(
            function_name,
            input_features,
            outputs,
            ExecutionMode::Vectorized(Arc::new(function)),
        )
    }

    fn new(
        function_name: impl Into<String>,
        input_features: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
        mode: ExecutionMode,
    ) -> TransformationFunctionBinding {
        TransformationFunctionBinding {
            function_name: function_name.into(),
            input_features: input_features.into_iter().map(Into::into).collect(),
            outputs: outputs
                .into_iter()
                .map(|(name, feature_type)| TransformationOutput {
                    name: name.into(),
                    feature_type: feature_type.into(),
                })
                .collect(),
            mode,
            dropped_features: Vec::new(),
            transformation_type: TransformationType::OnDemand,
        }
    }

    /// Drop `features` from the dataframe after all transformations ran.
    pub fn with_dropped_features(
        mut self,
        features: impl IntoIterator<Item = impl Into<String>>,
    ) -> TransformationFunctionBinding {
        self.dropped_features = features.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the binding as model-dependent.
    pub fn model_dependent(mut self) -> TransformationFunctionBinding {
        self.transformation_type = TransformationType::ModelDependent;
        self
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|o| o.name.as_str())
    }
}

/// Apply `bindings` to `batch` in order.
///
/// Outputs are written under their declared names and types. A column that already exists under
/// an output name is replaced and moves to the end, so transformation outputs are always the last
/// columns.
/// Dropped features of all bindings are removed at the very end.
///
/// # Errors
///
/// - [`Error::MissingFeature`] if a binding's input is not a column of the dataframe at the time
///   the binding runs.
/// - [`Error::Encoding`] if a function returns a wrong number of outputs or columns of a wrong
///   length.
pub fn apply(
    bindings: &[TransformationFunctionBinding],
    batch: &RecordBatch,
    context: Option<&TransformationContext>,
) -> Result<RecordBatch> {
    let num_rows = batch.num_rows();
    let schema = batch.schema();
    let mut columns: Vec<(Arc<Field>, ArrayRef)> = schema
        .fields()
        .iter()
        .cloned()
        .zip(batch.columns().iter().cloned())
        .collect();
    let mut dropped: Vec<&str> = Vec::new();

    for binding in bindings {
        let inputs = resolve_inputs(binding, &columns)?;

        log::debug!(target: "featurestore",
            function = binding.function_name.as_str(), rows = num_rows;
            "applying transformation function");

        let outputs = match &binding.mode {
            ExecutionMode::Vectorized(function) => {
                let outputs = function(&inputs, context)?;
                if outputs.len() != binding.outputs.len() {
                    return Err(Error::Encoding(format!(
                        "transformation function '{}' returned {} columns but declares {} outputs",
                        binding.function_name,
                        outputs.len(),
                        binding.outputs.len()
                    )));
                }
                if let Some(bad) = outputs.iter().find(|o| o.len() != num_rows) {
                    return Err(Error::Encoding(format!(
                        "transformation function '{}' returned a column of {} rows for a dataframe of {} rows",
                        binding.function_name,
                        bad.len(),
                        num_rows
                    )));
                }
                outputs
                    .iter()
                    .zip(&binding.outputs)
                    .map(|(array, output)| {
                        cast_column(array, &arrow_type_from_offline(&output.feature_type)?)
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            ExecutionMode::RowWise(function) => {
                apply_row_wise(binding, function, &inputs, num_rows, context)?
            }
        };

        for (output, array) in binding.outputs.iter().zip(outputs) {
            columns.retain(|(field, _)| field.name() != &output.name);
            let field = Field::new(&output.name, array.data_type().clone(), true);
            columns.push((Arc::new(field), array));
        }

        dropped.extend(binding.dropped_features.iter().map(String::as_str));
    }

    for name in &dropped {
        if !columns.iter().any(|(field, _)| field.name() == name) {
            log::debug!(target: "featurestore", feature = name; "dropped feature not present in dataframe");
        }
    }
    columns.retain(|(field, _)| !dropped.contains(&field.name().as_str()));

    let (fields, arrays): (Vec<_>, Vec<_>) = columns.into_iter().unzip();
    let schema = Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()));
    let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
    Ok(RecordBatch::try_new_with_options(schema, arrays, &options)?)
}

fn resolve_inputs(
    binding: &TransformationFunctionBinding,
    columns: &[(Arc<Field>, ArrayRef)],
) -> Result<Vec<ArrayRef>> {
    let mut missing = Vec::new();
    let mut inputs = Vec::with_capacity(binding.input_features.len());
    for name in &binding.input_features {
        match columns.iter().find(|(field, _)| field.name() == name) {
            Some((_, array)) => inputs.push(Arc::clone(array)),
            None => missing.push(name.clone()),
        }
    }

    if missing.is_empty() {
        Ok(inputs)
    } else {
        missing.sort();
        missing.dedup();
        Err(Error::MissingFeature {
            features: missing,
            function_name: binding.function_name.clone(),
            transformation_type: binding.transformation_type,
        })
    }
}

fn apply_row_wise(
    binding: &TransformationFunctionBinding,
    function: &RowWiseFn,
    inputs: &[ArrayRef],
    num_rows: usize,
    context: Option<&TransformationContext>,
) -> Result<Vec<ArrayRef>> {
    let mut outputs: Vec<Vec<FeatureValue>> = binding
        .outputs
        .iter()
        .map(|_| Vec::with_capacity(num_rows))
        .collect();
    let mut row = Vec::with_capacity(inputs.len());

    for i in 0..num_rows {
        row.clear();
        for input in inputs {
            row.push(FeatureValue::from_array(input.as_ref(), i)?);
        }

        let values = function(&row, context)?;
        if values.len() != outputs.len() {
            return Err(Error::Encoding(format!(
                "transformation function '{}' returned {} values but declares {} outputs",
                binding.function_name,
                values.len(),
                outputs.len()
            )));
        }
        for (column, value) in outputs.iter_mut().zip(values) {
            column.push(value);
        }
    }

    binding
        .outputs
        .iter()
        .zip(outputs)
        .map(|(output, values)| {
            let data_type = arrow_type_from_offline(&output.feature_type)?;
            build_array(&data_type, &values)
        })
        .collect()
}
