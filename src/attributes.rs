//! Attribute keyword registry
//!
//! Callers name extra attributes by keyword. Standard keywords resolve through
//! the DICOM standard dictionary; the pacsman private attributes, which carry
//! aggregated patient fields, are layered on top. The registry is built once
//! and never mutated.

use std::collections::BTreeMap;

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_object::InMemDicomObject;
use dimse::types::{element_str, keyword_tag};
use once_cell::sync::Lazy;
use tracing::warn;

/// Private creator value written into (0009,0010)
pub const PRIVATE_CREATOR: &str = "pacsman";

pub const PACSMAN_PRIVATE_IDENTIFIER: Tag = Tag(0x0009, 0x0010);
pub const PATIENT_STUDY_IDS: Tag = Tag(0x0009, 0x1001);
pub const PATIENT_MOST_RECENT_STUDY_DATE: Tag = Tag(0x0009, 0x1002);

/// A private attribute known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateAttribute {
    pub tag: Tag,
    pub vr: VR,
    pub keyword: &'static str,
}

const PRIVATE_ATTRIBUTES: [PrivateAttribute; 3] = [
    PrivateAttribute {
        tag: PACSMAN_PRIVATE_IDENTIFIER,
        vr: VR::LO,
        keyword: "PacsmanPrivateIdentifier",
    },
    PrivateAttribute {
        tag: PATIENT_STUDY_IDS,
        vr: VR::CS,
        keyword: "PatientStudyIDs",
    },
    PrivateAttribute {
        tag: PATIENT_MOST_RECENT_STUDY_DATE,
        vr: VR::DA,
        keyword: "PatientMostRecentStudyDate",
    },
];

static REGISTRY: Lazy<AttributeRegistry> = Lazy::new(AttributeRegistry::build);

/// Keyword to tag lookup for standard and private attributes
#[derive(Debug)]
pub struct AttributeRegistry {
    private: BTreeMap<&'static str, PrivateAttribute>,
}

impl AttributeRegistry {
    /// The process-wide registry
    pub fn global() -> &'static AttributeRegistry {
        &REGISTRY
    }

    fn build() -> Self {
        let private = PRIVATE_ATTRIBUTES
            .iter()
            .map(|attr| (attr.keyword, *attr))
            .collect();
        Self { private }
    }

    /// Resolve a keyword to its tag
    pub fn tag(&self, keyword: &str) -> Option<Tag> {
        self.private
            .get(keyword)
            .map(|attr| attr.tag)
            .or_else(|| keyword_tag(keyword))
    }

    pub fn private_attribute(&self, keyword: &str) -> Option<&PrivateAttribute> {
        self.private.get(keyword)
    }

    pub fn is_private(&self, keyword: &str) -> bool {
        self.private.contains_key(keyword)
    }

    /// Keywords that can be sent to the archive as return keys.
    ///
    /// Private keywords are computed locally and unknown keywords are
    /// dropped with a warning.
    pub fn return_keys<'a>(&self, keywords: &'a [String]) -> Vec<&'a str> {
        keywords
            .iter()
            .filter_map(|keyword| {
                if self.is_private(keyword) {
                    None
                } else if keyword_tag(keyword).is_some() {
                    Some(keyword.as_str())
                } else {
                    warn!("Ignoring unknown attribute keyword '{}'", keyword);
                    None
                }
            })
            .collect()
    }

    /// Copy the requested attributes present in `dataset` as strings
    pub fn copy_extra(
        &self,
        dataset: &InMemDicomObject,
        keywords: &[String],
    ) -> BTreeMap<String, String> {
        keywords
            .iter()
            .filter_map(|keyword| {
                let tag = self.tag(keyword)?;
                element_str(dataset, tag).map(|value| (keyword.clone(), value))
            })
            .collect()
    }

    /// Build a private element; multi-valued attributes are joined with `\`
    pub fn private_element(
        &self,
        keyword: &str,
        values: &[String],
    ) -> Option<DataElement<InMemDicomObject>> {
        let attr = self.private.get(keyword)?;
        let value = match values {
            [] => PrimitiveValue::Empty,
            [single] => PrimitiveValue::from(single.as_str()),
            many => PrimitiveValue::Strs(many.iter().cloned().collect()),
        };
        Some(DataElement::new(attr.tag, attr.vr, value))
    }
}
