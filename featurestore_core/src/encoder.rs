//! Avro encoding of feature group rows.
//!
//! Complex features (arrays, structs and maps) are encoded on their own first and their bytes
//! take the place of the value in the row, which is then encoded as a whole. Consumers can decode
//! the top-level fields of a row without decoding the nested ones.
use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
};

use arrow::{
    array::{new_null_array, Array, ArrayRef, BinaryArray, RecordBatch},
    datatypes::{Field, Schema, SchemaRef},
    util::display::array_value_to_string,
};
use arrow_avro::{
    schema::FingerprintStrategy,
    writer::{format::AvroSoeFormat, Writer, WriterBuilder},
};

use crate::{feature_group::FeatureGroup, schema::cast_column, Error, Result};

/// Single-object encoding prefix written by the Avro writer: magic byte and 4-byte schema id.
const SOE_HEADER_SIZE: usize = 5;
const SOE_MAGIC: u8 = 0x00;

/// Sink shared between an Avro writer and its [`DatumEncoder`], drained after every row.
#[derive(Debug, Clone, Default)]
struct RowBuffer(Arc<Mutex<Vec<u8>>>);

impl RowBuffer {
    fn take(&self) -> Result<Vec<u8>> {
        let mut buf = self
            .0
            .lock()
            .map_err(|_| Error::Encoding("row buffer lock poisoned".to_owned()))?;
        Ok(std::mem::take(&mut *buf))
    }
}

impl Write for RowBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("row buffer lock poisoned"))?
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Encodes one-row batches of a fixed schema as bare Avro binary datums.
///
/// The Avro writer is built once and reused for every row.
#[derive(Debug, Clone)]
struct DatumEncoder {
    schema: SchemaRef,
    writer: Arc<Mutex<Writer<RowBuffer, AvroSoeFormat>>>,
    buffer: RowBuffer,
}

impl DatumEncoder {
    fn new(schema: SchemaRef) -> Result<Self> {
        let buffer = RowBuffer::default();
        let writer = WriterBuilder::new(schema.as_ref().clone())
            .with_fingerprint_strategy(FingerprintStrategy::Id(0))
            .build::<_, AvroSoeFormat>(buffer.clone())?;
        Ok(Self {
            schema,
            writer: Arc::new(Mutex::new(writer)),
            buffer,
        })
    }

    fn encode(&self, columns: Vec<ArrayRef>) -> Result<Vec<u8>> {
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), columns)?;
        if batch.num_rows() != 1 {
            return Err(Error::Encoding(format!(
                "expected a single row, got {}",
                batch.num_rows()
            )));
        }

        let mut buf = {
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| Error::Encoding("avro writer lock poisoned".to_owned()))?;
            // drop leftovers of a row that failed halfway
            self.buffer.take()?;
            writer.write(&batch)?;
            self.buffer.take()?
        };

        match buf.first() {
            Some(&SOE_MAGIC) if buf.len() >= SOE_HEADER_SIZE => {
                Ok(buf.split_off(SOE_HEADER_SIZE))
            }
            _ => Err(Error::Encoding(
                "avro writer produced an unexpected record header".to_owned(),
            )),
        }
    }
}

/// Encoders for the complex features of a feature group, in feature order.
#[derive(Debug, Clone, Default)]
pub struct ComplexFeatureEncoders {
    encoders: Vec<(String, DatumEncoder)>,
}

impl ComplexFeatureEncoders {
    pub fn len(&self) -> usize {
        self.encoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoders.is_empty()
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.encoders.iter().map(|(name, _)| name.as_str())
    }

    fn get(&self, name: &str) -> Option<&DatumEncoder> {
        self.encoders
            .iter()
            .find(|(feature, _)| feature == name)
            .map(|(_, encoder)| encoder)
    }
}

/// Encoder for whole rows of a feature group.
#[derive(Debug, Clone)]
pub struct RowEncoder {
    /// Declared schema rows are normalized to.
    source_schema: SchemaRef,
    /// Schema of the encoded row, with complex features as bytes.
    encoded: DatumEncoder,
}

impl RowEncoder {
    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.encoded.schema)
    }
}

/// Build the complex feature encoders and the row encoder of `fg`.
pub fn build_encoders(fg: &FeatureGroup) -> Result<(ComplexFeatureEncoders, RowEncoder)> {
    let source_schema = fg.arrow_schema()?;

    let encoders = fg
        .complex_features()
        .into_iter()
        .map(|feature| {
            let field = source_schema.field_with_name(&feature.name)?.clone();
            let encoder = DatumEncoder::new(Arc::new(Schema::new(vec![field])))?;
            Ok((feature.name.clone(), encoder))
        })
        .collect::<Result<Vec<_>>>()?;

    let row_encoder = RowEncoder {
        source_schema,
        encoded: DatumEncoder::new(fg.encoded_arrow_schema()?)?,
    };

    log::debug!(target: "featurestore",
        feature_group = fg.name.as_str(), complex_features = encoders.len();
        "built row encoders");

    Ok((ComplexFeatureEncoders { encoders }, row_encoder))
}

/// Encode the single row of `row` into Avro binary.
///
/// Columns are matched by name against the feature group schema and normalized first: list-like
/// columns become lists, naive timestamps are read as UTC, and missing or null-typed columns become
/// absent values.
pub fn encode_row(
    complex: &ComplexFeatureEncoders,
    row_encoder: &RowEncoder,
    row: &RecordBatch,
) -> Result<Vec<u8>> {
    if row.num_rows() != 1 {
        return Err(Error::Encoding(format!(
            "encode_row expects a single row, got {}",
            row.num_rows()
        )));
    }

    let mut columns = Vec::with_capacity(row_encoder.source_schema.fields().len());
    for field in row_encoder.source_schema.fields() {
        let value = normalize(row.column_by_name(field.name()), field)?;
        let column = match complex.get(field.name()) {
            Some(encoder) => {
                let bytes = encoder.encode(vec![value])?;
                Arc::new(BinaryArray::from_vec(vec![bytes.as_slice()])) as ArrayRef
            }
            None => value,
        };
        columns.push(column);
    }

    row_encoder.encoded.encode(columns)
}

/// Encode every row of `batch`, in row order.
pub fn encode_batch(
    complex: &ComplexFeatureEncoders,
    row_encoder: &RowEncoder,
    batch: &RecordBatch,
) -> Result<Vec<Vec<u8>>> {
    (0..batch.num_rows())
        .map(|i| encode_row(complex, row_encoder, &batch.slice(i, 1)))
        .collect()
}

fn normalize(column: Option<&ArrayRef>, field: &Field) -> Result<ArrayRef> {
    match column {
        None => Ok(new_null_array(field.data_type(), 1)),
        Some(column) => cast_column(column, field.data_type()),
    }
}

/// Partitioning key of a row: the values of the primary key columns concatenated in key name
/// order.
pub fn row_key(batch: &RecordBatch, row: usize, primary_key: &[String]) -> Result<String> {
    let mut keys: Vec<&String> = primary_key.iter().collect();
    keys.sort();

    let mut key = String::new();
    for name in keys {
        let column = batch.column_by_name(name).ok_or_else(|| {
            Error::Encoding(format!("primary key column `{name}` is missing from the row"))
        })?;
        if column.is_valid(row) {
            key.push_str(&array_value_to_string(column, row)?);
        }
    }
    Ok(key)
}
