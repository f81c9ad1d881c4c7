//! Per-partition topic offsets used to resume the materialization job.
use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::{Error, Result};

/// Offsets of every partition of a topic at one point in time.
///
/// Serialized as `topic,partition:offset[,partition:offset]*`, the format the materialization job
/// accepts as its initial checkpoint.
///
/// ```
/// # use featurestore_core::checkpoint::Checkpoint;
/// let checkpoint: Checkpoint = "fg_topic,0:15,1:3".parse().unwrap();
/// assert_eq!(checkpoint.offset(1), Some(3));
/// assert_eq!(checkpoint.to_string(), "fg_topic,0:15,1:3");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub topic: String,
    pub offsets: BTreeMap<i32, i64>,
}

impl Checkpoint {
    pub fn new(topic: impl Into<String>) -> Checkpoint {
        Checkpoint {
            topic: topic.into(),
            offsets: BTreeMap::new(),
        }
    }

    pub fn with_offset(mut self, partition: i32, offset: i64) -> Checkpoint {
        self.offsets.insert(partition, offset);
        self
    }

    pub fn offset(&self, partition: i32) -> Option<i64> {
        self.offsets.get(&partition).copied()
    }

    /// Return `true` if every partition of `earlier` has an offset in `self` that is at least as
    /// large.
    pub fn dominates(&self, earlier: &Checkpoint) -> bool {
        self.topic == earlier.topic
            && earlier
                .offsets
                .iter()
                .all(|(partition, offset)| self.offset(*partition).is_some_and(|o| o >= *offset))
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic)?;
        for (partition, offset) in &self.offsets {
            write!(f, ",{partition}:{offset}")?;
        }
        Ok(())
    }
}

impl FromStr for Checkpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Checkpoint> {
        let invalid = || Error::InvalidArgument(format!("invalid checkpoint `{s}`"));

        let mut parts = s.split(',');
        let topic = parts.next().filter(|t| !t.is_empty()).ok_or_else(invalid)?;
        let mut checkpoint = Checkpoint::new(topic);
        for part in parts {
            let (partition, offset) = part.split_once(':').ok_or_else(invalid)?;
            checkpoint.offsets.insert(
                partition.parse().map_err(|_| invalid())?,
                offset.parse().map_err(|_| invalid())?,
            );
        }
        Ok(checkpoint)
    }
}

/// Textual form of an optional checkpoint, empty when absent.
pub fn checkpoint_string(checkpoint: Option<&Checkpoint>) -> String {
    checkpoint.map(Checkpoint::to_string).unwrap_or_default()
}
