//! Core domain model for provider-directory synchronization.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod attributes;
pub mod entity;
pub mod predicate;
pub mod store;

pub use attributes::{Access, Attribute, AttributeDef, AttributeKind, AttributeSource, AttributeTable};
pub use entity::{
    Address, CanonicalEntity, CanonicalGraph, EntityId, EntityKind, Facility, GraphError, Group,
    Individual,
};
pub use predicate::{
    split_by_condition_limit, Condition, ConditionOp, EqualityPredicate, Predicate, PredicateError,
};
pub use store::{StoreEntity, StoreId, StoreRef};

pub const CRATE_NAME: &str = "pdir-core";

/// Canonical entity discriminator shared by the source model and the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Individual,
    Facility,
    Group,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Individual, Variant::Facility, Variant::Group];

    /// Collection name of this variant in the target store.
    pub fn entity_set(self) -> &'static str {
        match self {
            Variant::Individual => "pd_individuals",
            Variant::Facility => "pd_facilities",
            Variant::Group => "pd_groups",
        }
    }

    /// Primary-key field of this variant in the target store.
    pub fn id_field(self) -> &'static str {
        match self {
            Variant::Individual => "pd_individualid",
            Variant::Facility => "pd_facilityid",
            Variant::Group => "pd_groupid",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variant::Individual => "individual",
            Variant::Facility => "facility",
            Variant::Group => "group",
        };
        f.write_str(name)
    }
}

/// A single attribute value as exchanged with the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Flag(bool),
    Integer(i64),
    Text(String),
}

impl AttributeValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Text value, or `None` for a blank string so empty and missing collapse.
    pub fn non_blank(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self::Text(trimmed.to_string()))
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Text(s) if s.trim().is_empty())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Equality as the store applies it: text compares case-insensitively.
    pub fn matches(&self, other: &AttributeValue) -> bool {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Flag(a), Self::Flag(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// One denormalized row from the provider-directory source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRecord {
    #[serde(rename = "npi")]
    pub individual_id: String,
    #[serde(rename = "ind_pac_id")]
    pub individual_pac_id: String,
    #[serde(rename = "ind_enrl_id")]
    pub enrollment_id: String,
    #[serde(rename = "provider_last_name")]
    pub last_name: String,
    #[serde(rename = "provider_first_name")]
    pub first_name: String,
    #[serde(rename = "provider_middle_name")]
    pub middle_name: String,
    #[serde(rename = "suff")]
    pub suffix: String,
    #[serde(rename = "gndr")]
    pub gender: String,
    #[serde(rename = "cred")]
    pub credential: String,
    #[serde(rename = "med_sch")]
    pub medical_school: String,
    #[serde(rename = "grd_yr")]
    pub graduation_year: String,
    #[serde(rename = "pri_spec")]
    pub primary_specialty: String,
    #[serde(rename = "sec_spec_1")]
    pub secondary_specialty_1: String,
    #[serde(rename = "sec_spec_2")]
    pub secondary_specialty_2: String,
    #[serde(rename = "sec_spec_3")]
    pub secondary_specialty_3: String,
    #[serde(rename = "sec_spec_4")]
    pub secondary_specialty_4: String,
    #[serde(rename = "sec_spec_all")]
    pub secondary_specialties_all: String,
    #[serde(rename = "telehlth")]
    pub telehealth: String,
    pub facility_name: String,
    #[serde(rename = "org_pac_id")]
    pub group_id: String,
    #[serde(rename = "num_org_mem")]
    pub group_member_count: String,
    #[serde(rename = "adr_ln_1")]
    pub address_line1: String,
    #[serde(rename = "adr_ln_2")]
    pub address_line2: String,
    #[serde(rename = "ln_2_sprs")]
    pub line2_suppressed: String,
    #[serde(rename = "citytown")]
    pub city: String,
    pub state: String,
    #[serde(rename = "zip_code")]
    pub zip: String,
    #[serde(rename = "telephone_number")]
    pub phone: String,
    #[serde(rename = "ind_assgn")]
    pub individual_medicare: String,
    #[serde(rename = "grp_assgn")]
    pub group_medicare: String,
    #[serde(rename = "adrs_id")]
    pub address_id: String,
}

fn flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_uppercase().as_str(),
        "Y" | "YES" | "TRUE" | "1"
    )
}

impl RawRecord {
    /// An empty group id means the individual is unaffiliated.
    pub fn has_group(&self) -> bool {
        !self.group_id.trim().is_empty()
    }

    pub fn is_line2_suppressed(&self) -> bool {
        flag(&self.line2_suppressed)
    }

    pub fn offers_telehealth(&self) -> bool {
        flag(&self.telehealth)
    }

    pub fn individual_accepts_medicare(&self) -> bool {
        flag(&self.individual_medicare)
    }

    pub fn group_accepts_medicare(&self) -> bool {
        flag(&self.group_medicare)
    }

    pub fn group_members(&self) -> Option<u32> {
        self.group_member_count.trim().parse().ok()
    }

    pub fn graduation_year(&self) -> Option<i32> {
        self.graduation_year.trim().parse().ok()
    }

    /// Secondary specialties, preferring the numbered columns over the combined string.
    pub fn secondary_specialties(&self) -> Vec<String> {
        let numbered: Vec<String> = [
            &self.secondary_specialty_1,
            &self.secondary_specialty_2,
            &self.secondary_specialty_3,
            &self.secondary_specialty_4,
        ]
        .into_iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect();
        if !numbered.is_empty() {
            return numbered;
        }
        self.secondary_specialties_all
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}
