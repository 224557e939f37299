//! Static attribute mapping between canonical entities and store fields.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::predicate::PredicateError;
use crate::{AttributeValue, Variant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeKind {
    Text,
    Integer,
    Flag,
    /// Integer code resolved through the option-set lookup.
    OptionSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    ReadWrite,
    /// Identity fields: written when a record is created, never on update.
    CreateOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeDef {
    pub variant: Variant,
    pub field: &'static str,
    pub kind: AttributeKind,
    pub access: Access,
}

const fn def(variant: Variant, field: &'static str, kind: AttributeKind, access: Access) -> AttributeDef {
    AttributeDef {
        variant,
        field,
        kind,
        access,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Attribute {
    EnrollmentId,
    Npi,
    FirstName,
    MiddleName,
    LastName,
    Suffix,
    Gender,
    Credential,
    MedicalSchool,
    GraduationYear,
    PrimarySpecialty,
    SecondarySpecialties,
    Telehealth,
    IndividualMedicare,

    FacilityName,
    AddressId,
    AddressLine1,
    AddressLine2,
    Line2Suppressed,
    City,
    State,
    Zip,
    Phone,
    AffiliatedCount,

    GroupId,
    GroupName,
    GroupMemberCount,
    GroupMedicare,
}

impl Attribute {
    pub const ALL: [Attribute; 28] = [
        Attribute::EnrollmentId,
        Attribute::Npi,
        Attribute::FirstName,
        Attribute::MiddleName,
        Attribute::LastName,
        Attribute::Suffix,
        Attribute::Gender,
        Attribute::Credential,
        Attribute::MedicalSchool,
        Attribute::GraduationYear,
        Attribute::PrimarySpecialty,
        Attribute::SecondarySpecialties,
        Attribute::Telehealth,
        Attribute::IndividualMedicare,
        Attribute::FacilityName,
        Attribute::AddressId,
        Attribute::AddressLine1,
        Attribute::AddressLine2,
        Attribute::Line2Suppressed,
        Attribute::City,
        Attribute::State,
        Attribute::Zip,
        Attribute::Phone,
        Attribute::AffiliatedCount,
        Attribute::GroupId,
        Attribute::GroupName,
        Attribute::GroupMemberCount,
        Attribute::GroupMedicare,
    ];

    pub const fn def(self) -> AttributeDef {
        use Access::*;
        use AttributeKind::*;
        use Variant::{Facility as F, Group as G, Individual as I};
        match self {
            Attribute::EnrollmentId => def(I, "pd_enrollmentid", Text, CreateOnly),
            Attribute::Npi => def(I, "pd_npi", Text, ReadWrite),
            Attribute::FirstName => def(I, "pd_firstname", Text, ReadWrite),
            Attribute::MiddleName => def(I, "pd_middlename", Text, ReadWrite),
            Attribute::LastName => def(I, "pd_lastname", Text, ReadWrite),
            Attribute::Suffix => def(I, "pd_suffix", Text, ReadWrite),
            Attribute::Gender => def(I, "pd_gender", Text, ReadWrite),
            Attribute::Credential => def(I, "pd_credential", Text, ReadWrite),
            Attribute::MedicalSchool => def(I, "pd_medicalschool", Text, ReadWrite),
            Attribute::GraduationYear => def(I, "pd_graduationyear", Integer, ReadWrite),
            Attribute::PrimarySpecialty => def(I, "pd_primaryspecialty", OptionSet, ReadWrite),
            Attribute::SecondarySpecialties => def(I, "pd_secondaryspecialties", Text, ReadWrite),
            Attribute::Telehealth => def(I, "pd_telehealth", Flag, ReadWrite),
            Attribute::IndividualMedicare => def(I, "pd_acceptsmedicare", Flag, ReadWrite),
            Attribute::FacilityName => def(F, "pd_name", Text, ReadWrite),
            Attribute::AddressId => def(F, "pd_addressid", Text, ReadWrite),
            Attribute::AddressLine1 => def(F, "pd_addressline1", Text, ReadWrite),
            Attribute::AddressLine2 => def(F, "pd_addressline2", Text, ReadWrite),
            Attribute::Line2Suppressed => def(F, "pd_line2suppressed", Flag, ReadWrite),
            Attribute::City => def(F, "pd_city", Text, ReadWrite),
            Attribute::State => def(F, "pd_state", Text, ReadWrite),
            Attribute::Zip => def(F, "pd_zip", Text, ReadWrite),
            Attribute::Phone => def(F, "pd_phone", Text, ReadWrite),
            Attribute::AffiliatedCount => def(F, "pd_affiliatedcount", Integer, ReadWrite),
            Attribute::GroupId => def(G, "pd_grouppacid", Text, CreateOnly),
            Attribute::GroupName => def(G, "pd_name", Text, ReadWrite),
            Attribute::GroupMemberCount => def(G, "pd_membercount", Integer, ReadWrite),
            Attribute::GroupMedicare => def(G, "pd_acceptsmedicare", Flag, ReadWrite),
        }
    }

    pub const fn variant(self) -> Variant {
        self.def().variant
    }

    pub const fn field(self) -> &'static str {
        self.def().field
    }

    pub const fn kind(self) -> AttributeKind {
        self.def().kind
    }

    pub fn for_variant(variant: Variant) -> impl Iterator<Item = Attribute> {
        Self::ALL.into_iter().filter(move |a| a.variant() == variant)
    }

    /// Attributes pushed on update; identity fields are excluded.
    pub fn writable_on_update(variant: Variant) -> impl Iterator<Item = Attribute> {
        Self::for_variant(variant).filter(|a| a.def().access == Access::ReadWrite)
    }
}

/// Anything a predicate can be evaluated against.
pub trait AttributeSource {
    fn variant(&self) -> Variant;

    fn value(&self, attribute: Attribute) -> Option<AttributeValue>;

    /// Blank text counts as absent.
    fn has_attribute(&self, attribute: Attribute) -> bool {
        self.value(attribute).is_some_and(|v| !v.is_blank())
    }
}

/// Field-name index over the static attribute definitions, built once per run.
#[derive(Debug, Clone)]
pub struct AttributeTable {
    by_field: HashMap<(Variant, &'static str), Attribute>,
}

impl AttributeTable {
    pub fn standard() -> Self {
        let by_field = Attribute::ALL
            .into_iter()
            .map(|a| ((a.variant(), a.field()), a))
            .collect();
        Self { by_field }
    }

    pub fn lookup(&self, variant: Variant, field: &str) -> Option<Attribute> {
        self.by_field.get(&(variant, field)).copied()
    }

    pub fn resolve(&self, variant: Variant, field: &str) -> Result<Attribute, PredicateError> {
        self.lookup(variant, field)
            .ok_or_else(|| PredicateError::UnknownAttribute {
                variant,
                field: field.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.by_field.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_field.is_empty()
    }
}

impl Default for AttributeTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_are_unique_per_variant() {
        let table = AttributeTable::standard();
        assert_eq!(table.len(), Attribute::ALL.len());
    }

    #[test]
    fn same_field_name_resolves_per_variant() {
        let table = AttributeTable::standard();
        assert_eq!(table.lookup(Variant::Facility, "pd_name"), Some(Attribute::FacilityName));
        assert_eq!(table.lookup(Variant::Group, "pd_name"), Some(Attribute::GroupName));
        assert_eq!(table.lookup(Variant::Individual, "pd_name"), None);
    }

    #[test]
    fn unknown_field_is_a_structural_error() {
        let err = AttributeTable::standard()
            .resolve(Variant::Group, "pd_nope")
            .unwrap_err();
        assert!(matches!(err, PredicateError::UnknownAttribute { .. }));
    }

    #[test]
    fn identity_fields_are_not_updated() {
        let update: Vec<_> = Attribute::writable_on_update(Variant::Individual).collect();
        assert!(!update.contains(&Attribute::EnrollmentId));
        assert!(update.contains(&Attribute::LastName));
        assert!(Attribute::writable_on_update(Variant::Facility).any(|a| a == Attribute::AddressId));
    }
}
