//! Common types for DIMSE operations

use std::collections::BTreeMap;

use dicom_core::dictionary::DataDictionary;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};

use crate::status::StatusOutcome;
use crate::{DimseError, Result};

/// Verification SOP Class
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
/// Study Root Query/Retrieve Information Model - FIND
pub const STUDY_ROOT_FIND_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.2.2.1";
/// Study Root Query/Retrieve Information Model - MOVE
pub const STUDY_ROOT_MOVE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.2.2.2";

/// Implicit VR Little Endian
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
/// Explicit VR Little Endian
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// DIMSE command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimseCommand {
    /// C-ECHO command
    Echo,
    /// C-FIND command
    Find,
    /// C-MOVE command
    Move,
    /// C-STORE command
    Store,
}

impl DimseCommand {
    /// Abstract syntax negotiated for this command on an outbound association.
    ///
    /// C-STORE has no fixed abstract syntax (it is the SOP class of the
    /// instance), so it yields `None`.
    pub fn abstract_syntax(&self) -> Option<&'static str> {
        match self {
            DimseCommand::Echo => Some(VERIFICATION_SOP_CLASS),
            DimseCommand::Find => Some(STUDY_ROOT_FIND_SOP_CLASS),
            DimseCommand::Move => Some(STUDY_ROOT_MOVE_SOP_CLASS),
            DimseCommand::Store => None,
        }
    }
}

impl std::fmt::Display for DimseCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimseCommand::Echo => write!(f, "C-ECHO"),
            DimseCommand::Find => write!(f, "C-FIND"),
            DimseCommand::Move => write!(f, "C-MOVE"),
            DimseCommand::Store => write!(f, "C-STORE"),
        }
    }
}

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLevel {
    /// Patient level
    Patient,
    /// Study level
    Study,
    /// Series level
    Series,
    /// Image level
    Image,
}

impl QueryLevel {
    /// Keyword of the attribute that uniquely identifies an entity at this level
    pub fn unique_key(&self) -> &'static str {
        match self {
            QueryLevel::Patient => "PatientID",
            QueryLevel::Study => "StudyInstanceUID",
            QueryLevel::Series => "SeriesInstanceUID",
            QueryLevel::Image => "SOPInstanceUID",
        }
    }
}

/// Query parameters for C-FIND operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindQuery {
    /// Query level (PATIENT, STUDY, SERIES, IMAGE)
    pub query_level: QueryLevel,

    /// Matching and return keys, by attribute keyword. An empty value is a
    /// return key (universal match).
    pub parameters: BTreeMap<String, String>,
}

/// Query parameters for C-MOVE operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveQuery {
    /// Query level (PATIENT, STUDY, SERIES, IMAGE)
    pub query_level: QueryLevel,

    /// Unique keys selecting the instances to move
    pub parameters: BTreeMap<String, String>,

    /// Destination AE Title for the move operation
    pub destination_aet: String,

    /// Priority of the move operation
    pub priority: MovePriority,
}

/// Priority levels for C-MOVE operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MovePriority {
    /// Low priority
    Low,
    /// Medium priority (default)
    #[default]
    Medium,
    /// High priority
    High,
}

impl MovePriority {
    /// Value of the Priority (0000,0700) command element
    pub fn code(&self) -> u16 {
        match self {
            MovePriority::Low => 0x0002,
            MovePriority::Medium => 0x0000,
            MovePriority::High => 0x0001,
        }
    }
}

/// Sub-operation counters reported by C-MOVE responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MoveProgress {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// One response message of a C-FIND or C-MOVE exchange
#[derive(Debug, Clone)]
pub struct DimseResponse {
    /// Raw status (0000,0900)
    pub status: u16,
    /// Identifier data set, if the response carried one
    pub dataset: Option<InMemDicomObject>,
    /// Sub-operation counters (C-MOVE only)
    pub progress: Option<MoveProgress>,
}

impl DimseResponse {
    /// A response with the given status and identifier
    pub fn new(status: u16, dataset: Option<InMemDicomObject>) -> Self {
        Self {
            status,
            dataset,
            progress: None,
        }
    }

    pub fn outcome(&self) -> StatusOutcome {
        StatusOutcome::classify(self.status)
    }
}

impl FindQuery {
    /// Create an empty query at the given level
    pub fn new(query_level: QueryLevel) -> Self {
        Self {
            query_level,
            parameters: BTreeMap::new(),
        }
    }

    /// Create a new study-level query
    pub fn study() -> Self {
        Self::new(QueryLevel::Study)
    }

    /// Create a new series-level query
    pub fn series() -> Self {
        Self::new(QueryLevel::Series)
    }

    /// Create a new image-level query
    pub fn image() -> Self {
        Self::new(QueryLevel::Image)
    }

    /// Add a matching key
    pub fn with_parameter(mut self, keyword: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(keyword.into(), value.into());
        self
    }

    /// Add a return key, keeping any matching value already set for it
    pub fn with_return_key(mut self, keyword: impl Into<String>) -> Self {
        self.parameters.entry(keyword.into()).or_default();
        self
    }

    /// Add several return keys
    pub fn with_return_keys<I, S>(self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        keywords
            .into_iter()
            .fold(self, |query, keyword| query.with_return_key(keyword))
    }

    /// Build the identifier data set sent with the C-FIND request
    pub fn to_identifier(&self) -> Result<InMemDicomObject> {
        build_identifier(self.query_level, &self.parameters)
    }

    /// Whether `dataset` satisfies every non-empty matching key of this query
    pub fn matches(&self, dataset: &InMemDicomObject) -> bool {
        self.parameters
            .iter()
            .filter(|(_, pattern)| !pattern.is_empty())
            .all(|(keyword, pattern)| {
                let value = keyword_tag(keyword)
                    .and_then(|tag| element_str(dataset, tag))
                    .unwrap_or_default();
                matches_pattern(pattern, &value)
            })
    }
}

impl MoveQuery {
    /// Create a new move query
    pub fn new(query_level: QueryLevel, destination_aet: impl Into<String>) -> Self {
        Self {
            query_level,
            parameters: BTreeMap::new(),
            destination_aet: destination_aet.into(),
            priority: MovePriority::Medium,
        }
    }

    /// Add a query parameter
    pub fn with_parameter(mut self, keyword: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(keyword.into(), value.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: MovePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Build the identifier data set sent with the C-MOVE request
    pub fn to_identifier(&self) -> Result<InMemDicomObject> {
        build_identifier(self.query_level, &self.parameters)
    }
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
            QueryLevel::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = DimseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" | "INSTANCE" => Ok(QueryLevel::Image),
            _ => Err(DimseError::config(format!("Invalid query level: {}", s))),
        }
    }
}

/// Resolve a standard attribute keyword (or a `(gggg,eeee)` tag string)
pub fn keyword_tag(keyword: &str) -> Option<Tag> {
    StandardDataDictionary.parse_tag(keyword)
}

/// Read an element as a trimmed string. Missing or empty elements yield `None`.
pub fn element_str(dataset: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = dataset.element(tag).ok()?.to_str().ok()?;
    let trimmed = value.trim_end_matches(['\0', ' ']).trim_start();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Read an element as an unsigned integer
pub fn element_u32(dataset: &InMemDicomObject, tag: Tag) -> Option<u32> {
    dataset.element(tag).ok()?.to_int::<u32>().ok()
}

/// DICOM wildcard matching (`*` and `?`), case-insensitive.
///
/// An empty pattern is a universal match.
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    fn go(p: &[char], v: &[char]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some('*'), _) => go(&p[1..], v) || (!v.is_empty() && go(p, &v[1..])),
            (Some('?'), Some(_)) => go(&p[1..], &v[1..]),
            (Some(a), Some(b)) => a == b && go(&p[1..], &v[1..]),
            _ => false,
        }
    }
    if pattern.is_empty() {
        return true;
    }
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let v: Vec<char> = value.to_lowercase().chars().collect();
    go(&p, &v)
}

// Queries go out under Implicit VR Little Endian, so the VR never reaches the
// wire; it only matters for local inspection of the identifier.
fn keyword_vr(tag: Tag) -> VR {
    match tag {
        tags::PATIENT_NAME => VR::PN,
        tags::PATIENT_BIRTH_DATE | tags::STUDY_DATE | tags::SERIES_DATE => VR::DA,
        tags::STUDY_TIME | tags::SERIES_TIME => VR::TM,
        tags::STUDY_INSTANCE_UID | tags::SERIES_INSTANCE_UID | tags::SOP_INSTANCE_UID => VR::UI,
        tags::MODALITY | tags::BODY_PART_EXAMINED | tags::PATIENT_POSITION => VR::CS,
        tags::NUMBER_OF_SERIES_RELATED_INSTANCES | tags::NUMBER_OF_STUDY_RELATED_INSTANCES => {
            VR::IS
        }
        tags::PATIENT_ID | tags::SERIES_DESCRIPTION | tags::STUDY_DESCRIPTION => VR::LO,
        _ => VR::UN,
    }
}

fn build_identifier(
    level: QueryLevel,
    parameters: &BTreeMap<String, String>,
) -> Result<InMemDicomObject> {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from(level.to_string()),
    ));

    for (keyword, value) in parameters {
        let tag = keyword_tag(keyword)
            .ok_or_else(|| DimseError::config(format!("Unknown attribute keyword: {}", keyword)))?;
        let value = if value.is_empty() {
            PrimitiveValue::Empty
        } else {
            PrimitiveValue::from(value.as_str())
        };
        obj.put(DataElement::new(tag, keyword_vr(tag), value));
    }

    Ok(obj)
}
