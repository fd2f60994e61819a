//! Request model for the events endpoint and its validation rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::event::EventType;

/// Where in the event stream a fetch begins.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Start {
    /// Oldest event the server still retains.
    Earliest,
    /// Only events arriving after the request.
    Latest,
    /// Immediately after an explicit resume offset.
    Offset,
}

impl Start {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earliest => "EARLIEST",
            Self::Latest => "LATEST",
            Self::Offset => "OFFSET",
        }
    }
}

impl fmt::Display for Start {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Start {
    type Err = RequestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [Self::Earliest, Self::Latest, Self::Offset]
            .into_iter()
            .find(|start| start.as_str() == value)
            .ok_or_else(|| RequestError::UnknownStart(value.to_string()))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Amazon,
    Android,
    Ios,
}

/// Selects events related to one push or push group.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSelector {
    PushId(String),
    GroupId(String),
}

/// Selects events for one device by channel or named user.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelector {
    AmazonChannel(String),
    AndroidChannel(String),
    IosChannel(String),
    NamedUserId(String),
}

/// One server-side filter. Multiple filters on a request are unioned; empty
/// fields are left off the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    #[serde(rename = "type", default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<EventType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_types: Vec<DeviceType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notification: Vec<NotificationSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceSelector>,
    /// Forwarded as given; the server interprets the range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<i64>,
}

impl Filter {
    /// Filter matching only the given event types.
    pub fn types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            types: types.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Filter matching only the given device families.
    pub fn device_types(device_types: impl IntoIterator<Item = DeviceType>) -> Self {
        Self {
            device_types: device_types.into_iter().collect(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubsetType {
    Partition,
    Sample,
    #[serde(other)]
    Unknown,
}

/// Server-side sampling or partitioning applied after filtering.
///
/// Use [`Subset::partition`] or [`Subset::sample`]; a default subset carries
/// no variant and is rejected by [`Subset::validate`].
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Subset {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SubsetType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proportion: Option<f64>,
}

impl Subset {
    /// Splits the stream into `count` partitions and selects one of them.
    pub fn partition(count: i64, selection: i64) -> Self {
        Self {
            kind: Some(SubsetType::Partition),
            count: Some(count),
            selection: Some(selection),
            proportion: None,
        }
    }

    /// Samples `proportion` (0..=1) of the stream.
    pub fn sample(proportion: f64) -> Self {
        Self {
            kind: Some(SubsetType::Sample),
            count: None,
            selection: None,
            proportion: Some(proportion),
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        match self.kind {
            None => Err(RequestError::EmptySubset),
            Some(SubsetType::Unknown) => Err(RequestError::UnknownSubsetType),
            Some(SubsetType::Partition) => {
                if self.proportion.is_some() {
                    return Err(RequestError::MixedSubset);
                }
                let (Some(count), Some(selection)) = (self.count, self.selection) else {
                    return Err(RequestError::InvalidPartition(
                        "count and selection are required".to_string(),
                    ));
                };
                if count < 1 {
                    return Err(RequestError::InvalidPartition(format!(
                        "count must be >= 1, got {count}"
                    )));
                }
                if selection < 0 || selection >= count {
                    return Err(RequestError::InvalidPartition(format!(
                        "selection must be in 0..{count}, got {selection}"
                    )));
                }
                Ok(())
            }
            Some(SubsetType::Sample) => {
                if self.count.is_some() || self.selection.is_some() {
                    return Err(RequestError::MixedSubset);
                }
                let Some(proportion) = self.proportion else {
                    return Err(RequestError::InvalidSample(
                        "proportion is required".to_string(),
                    ));
                };
                if !proportion.is_finite() || !(0.0..=1.0).contains(&proportion) {
                    return Err(RequestError::InvalidSample(format!(
                        "proportion must be in [0, 1], got {proportion}"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Body POSTed to the events endpoint.
///
/// Exactly one of `start` and `resume_offset` is set: `start` for
/// [`Start::Earliest`] / [`Start::Latest`], `resume_offset` alone when
/// resuming from an offset.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Start>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<Subset>,
}

impl Request {
    /// Builds a request from a start position and optional resume offset.
    ///
    /// `offset` must be set when `start` is [`Start::Offset`] and absent
    /// otherwise.
    pub fn new(start: Start, offset: Option<u64>) -> Result<Self, RequestError> {
        let (start, resume_offset) = match (start, offset) {
            (Start::Earliest | Start::Latest, None) => (Some(start), None),
            (Start::Earliest | Start::Latest, Some(_)) => {
                return Err(RequestError::UnexpectedOffset(start))
            }
            (Start::Offset, Some(offset)) => (None, Some(offset)),
            (Start::Offset, None) => return Err(RequestError::MissingOffset),
        };
        Ok(Self {
            start,
            resume_offset,
            filters: Vec::new(),
            subset: None,
        })
    }

    pub fn with_filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters = filters.into_iter().collect();
        self
    }

    pub fn with_subset(mut self, subset: Subset) -> Self {
        self.subset = Some(subset);
        self
    }

    /// Position this request resumes from, as passed to [`Request::new`].
    pub fn position(&self) -> Option<(Start, Option<u64>)> {
        match (self.start, self.resume_offset) {
            (Some(start @ (Start::Earliest | Start::Latest)), None) => Some((start, None)),
            (None, Some(offset)) => Some((Start::Offset, Some(offset))),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        match (self.start, self.resume_offset) {
            (Some(Start::Offset), _) => return Err(RequestError::OffsetAsStart),
            (Some(start), Some(_)) => return Err(RequestError::UnexpectedOffset(start)),
            (None, None) => return Err(RequestError::MissingStart),
            _ => {}
        }
        if let Some(subset) = &self.subset {
            subset.validate()?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("unknown start value {0:?}")]
    UnknownStart(String),

    #[error("request must set a start position or a resume offset")]
    MissingStart,

    #[error("start OFFSET requires a resume offset")]
    MissingOffset,

    #[error("a resume offset cannot be combined with start {0}")]
    UnexpectedOffset(Start),

    #[error("start OFFSET is expressed by resume_offset alone")]
    OffsetAsStart,

    #[error("subset has no type")]
    EmptySubset,

    #[error("unknown subset type")]
    UnknownSubsetType,

    #[error("subset mixes partition and sample fields")]
    MixedSubset,

    #[error("invalid partition subset: {0}")]
    InvalidPartition(String),

    #[error("invalid sample subset: {0}")]
    InvalidSample(String),
}
