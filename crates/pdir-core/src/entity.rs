//! Canonical entities and the cross-variant association graph.
//!
//! Entities live in an arena addressed by [`EntityId`]; adjacency is stored as
//! id lists on each entity and every edge is mirrored on both endpoints.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::attributes::{Attribute, AttributeSource};
use crate::{AttributeValue, RawRecord, Variant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u32);

impl EntityId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Individual {
    pub enrollment_id: String,
    pub npi: String,
    pub first_name: String,
    pub middle_name: String,
    pub last_name: String,
    pub suffix: String,
    pub gender: String,
    pub credential: String,
    pub medical_school: String,
    pub graduation_year: Option<i32>,
    pub primary_specialty: String,
    pub secondary_specialties: Vec<String>,
    pub telehealth: bool,
    pub accepts_medicare: bool,
}

impl Individual {
    pub fn from_record(record: &RawRecord) -> Self {
        Self {
            enrollment_id: record.enrollment_id.trim().to_string(),
            npi: record.individual_id.trim().to_string(),
            first_name: record.first_name.trim().to_string(),
            middle_name: record.middle_name.trim().to_string(),
            last_name: record.last_name.trim().to_string(),
            suffix: record.suffix.trim().to_string(),
            gender: record.gender.trim().to_string(),
            credential: record.credential.trim().to_string(),
            medical_school: record.medical_school.trim().to_string(),
            graduation_year: record.graduation_year(),
            primary_specialty: record.primary_specialty.trim().to_string(),
            secondary_specialties: record.secondary_specialties(),
            telehealth: record.offers_telehealth(),
            accepts_medicare: record.individual_accepts_medicare(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Address {
    pub id: String,
    pub line1: String,
    pub line2: String,
    pub line2_suppressed: bool,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl Address {
    pub fn from_record(record: &RawRecord) -> Self {
        Self {
            id: record.address_id.trim().to_string(),
            line1: record.address_line1.trim().to_string(),
            line2: record.address_line2.trim().to_string(),
            line2_suppressed: record.is_line2_suppressed(),
            city: record.city.trim().to_string(),
            state: record.state.trim().to_string(),
            zip: record.zip.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub name: String,
    pub address: Address,
    pub phone: String,
    /// Number of individuals consolidated onto this facility.
    pub affiliated_count: u32,
}

impl Facility {
    pub fn from_record(record: &RawRecord) -> Self {
        Self {
            name: record.facility_name.trim().to_string(),
            address: Address::from_record(record),
            phone: record.phone.trim().to_string(),
            affiliated_count: 1,
        }
    }

    /// Hex SHA-256 of the normalized name, used to bucket merge candidates.
    ///
    /// Every branch of the facility equality predicate requires the name, while
    /// the address may match through either the address id or the street lines,
    /// so only the name can be hashed. Bucket members are confirmed with the
    /// full predicate before two facilities are treated as one.
    pub fn bucket_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.trim().to_ascii_lowercase().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    pub name: String,
    pub member_count: Option<u32>,
    pub accepts_medicare: bool,
}

impl Group {
    pub fn from_record(record: &RawRecord) -> Self {
        Self {
            group_id: record.group_id.trim().to_string(),
            name: record.facility_name.trim().to_string(),
            member_count: record.group_members(),
            accepts_medicare: record.group_accepts_medicare(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum EntityKind {
    Individual(Individual),
    Facility(Facility),
    Group(Group),
}

impl EntityKind {
    pub fn variant(&self) -> Variant {
        match self {
            EntityKind::Individual(_) => Variant::Individual,
            EntityKind::Facility(_) => Variant::Facility,
            EntityKind::Group(_) => Variant::Group,
        }
    }

    /// Human-readable natural key for logs and reports.
    pub fn label(&self) -> String {
        match self {
            EntityKind::Individual(i) => format!("individual {}", i.enrollment_id),
            EntityKind::Group(g) => format!("group {}", g.group_id),
            EntityKind::Facility(f) => {
                if f.address.id.is_empty() {
                    format!("facility '{}' @ {}", f.name, f.address.line1)
                } else {
                    format!("facility '{}' @ {}", f.name, f.address.id)
                }
            }
        }
    }
}

fn text(value: &str) -> Option<AttributeValue> {
    AttributeValue::non_blank(value)
}

impl AttributeSource for EntityKind {
    fn variant(&self) -> Variant {
        EntityKind::variant(self)
    }

    fn value(&self, attribute: Attribute) -> Option<AttributeValue> {
        match (self, attribute) {
            (EntityKind::Individual(i), attr) => match attr {
                Attribute::EnrollmentId => text(&i.enrollment_id),
                Attribute::Npi => text(&i.npi),
                Attribute::FirstName => text(&i.first_name),
                Attribute::MiddleName => text(&i.middle_name),
                Attribute::LastName => text(&i.last_name),
                Attribute::Suffix => text(&i.suffix),
                Attribute::Gender => text(&i.gender),
                Attribute::Credential => text(&i.credential),
                Attribute::MedicalSchool => text(&i.medical_school),
                Attribute::GraduationYear => i.graduation_year.map(|y| AttributeValue::Integer(y.into())),
                Attribute::PrimarySpecialty => text(&i.primary_specialty),
                Attribute::SecondarySpecialties => text(&i.secondary_specialties.join(", ")),
                Attribute::Telehealth => Some(AttributeValue::Flag(i.telehealth)),
                Attribute::IndividualMedicare => Some(AttributeValue::Flag(i.accepts_medicare)),
                _ => None,
            },
            (EntityKind::Facility(f), attr) => match attr {
                Attribute::FacilityName => text(&f.name),
                Attribute::AddressId => text(&f.address.id),
                Attribute::AddressLine1 => text(&f.address.line1),
                Attribute::AddressLine2 => text(&f.address.line2),
                Attribute::Line2Suppressed => Some(AttributeValue::Flag(f.address.line2_suppressed)),
                Attribute::City => text(&f.address.city),
                Attribute::State => text(&f.address.state),
                Attribute::Zip => text(&f.address.zip),
                Attribute::Phone => text(&f.phone),
                Attribute::AffiliatedCount => Some(AttributeValue::Integer(f.affiliated_count.into())),
                _ => None,
            },
            (EntityKind::Group(g), attr) => match attr {
                Attribute::GroupId => text(&g.group_id),
                Attribute::GroupName => text(&g.name),
                Attribute::GroupMemberCount => g.member_count.map(|c| AttributeValue::Integer(c.into())),
                Attribute::GroupMedicare => Some(AttributeValue::Flag(g.accepts_medicare)),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    links: Vec<EntityId>,
}

impl CanonicalEntity {
    pub fn variant(&self) -> Variant {
        self.kind.variant()
    }

    pub fn links(&self) -> &[EntityId] {
        &self.links
    }

    pub fn as_facility(&self) -> Option<&Facility> {
        match &self.kind {
            EntityKind::Facility(f) => Some(f),
            _ => None,
        }
    }
}

impl AttributeSource for CanonicalEntity {
    fn variant(&self) -> Variant {
        self.kind.variant()
    }

    fn value(&self, attribute: Attribute) -> Option<AttributeValue> {
        self.kind.value(attribute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("entity {0} is not in the graph")]
    UnknownEntity(EntityId),
    #[error("entity {0} cannot be linked to itself")]
    SelfLink(EntityId),
    #[error("entities {a} and {b} are both {variant}; links must cross variants")]
    SameVariant { a: EntityId, b: EntityId, variant: Variant },
}

/// Arena of canonical entities with a symmetric, cross-variant adjacency.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CanonicalGraph {
    entities: Vec<CanonicalEntity>,
}

impl CanonicalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: EntityKind) -> EntityId {
        let id = EntityId(self.entities.len() as u32);
        self.entities.push(CanonicalEntity {
            id,
            kind,
            links: Vec::new(),
        });
        id
    }

    pub fn get(&self, id: EntityId) -> Option<&CanonicalEntity> {
        self.entities.get(id.index())
    }

    pub fn entity(&self, id: EntityId) -> Result<&CanonicalEntity, GraphError> {
        self.get(id).ok_or(GraphError::UnknownEntity(id))
    }

    pub fn kind_mut(&mut self, id: EntityId) -> Result<&mut EntityKind, GraphError> {
        self.entities
            .get_mut(id.index())
            .map(|e| &mut e.kind)
            .ok_or(GraphError::UnknownEntity(id))
    }

    /// Link two entities of different variants. Returns `false` if already linked.
    pub fn associate(&mut self, a: EntityId, b: EntityId) -> Result<bool, GraphError> {
        if a == b {
            return Err(GraphError::SelfLink(a));
        }
        let va = self.entity(a)?.variant();
        let vb = self.entity(b)?.variant();
        if va == vb {
            return Err(GraphError::SameVariant { a, b, variant: va });
        }
        if self.entities[a.index()].links.contains(&b) {
            return Ok(false);
        }
        self.entities[a.index()].links.push(b);
        self.entities[b.index()].links.push(a);
        Ok(true)
    }

    pub fn are_linked(&self, a: EntityId, b: EntityId) -> bool {
        self.get(a).is_some_and(|e| e.links.contains(&b))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanonicalEntity> {
        self.entities.iter()
    }

    pub fn of_variant(&self, variant: Variant) -> impl Iterator<Item = &CanonicalEntity> {
        self.entities.iter().filter(move |e| e.variant() == variant)
    }

    pub fn count(&self, variant: Variant) -> usize {
        self.of_variant(variant).count()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Undirected edge count.
    pub fn link_count(&self) -> usize {
        self.entities.iter().map(|e| e.links.len()).sum::<usize>() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(enrollment: &str, facility: &str, addr_id: &str) -> RawRecord {
        RawRecord {
            enrollment_id: enrollment.into(),
            facility_name: facility.into(),
            address_id: addr_id.into(),
            address_line1: "1 Main St".into(),
            ..Default::default()
        }
    }

    #[test]
    fn association_is_mirrored_and_idempotent() {
        let mut graph = CanonicalGraph::new();
        let rec = record("I1", "Clinic", "A1");
        let ind = graph.insert(EntityKind::Individual(Individual::from_record(&rec)));
        let fac = graph.insert(EntityKind::Facility(Facility::from_record(&rec)));

        assert!(graph.associate(ind, fac).unwrap());
        assert!(!graph.associate(fac, ind).unwrap());
        assert!(graph.are_linked(ind, fac));
        assert!(graph.are_linked(fac, ind));
        assert_eq!(graph.link_count(), 1);
    }

    #[test]
    fn self_and_same_variant_links_are_rejected() {
        let mut graph = CanonicalGraph::new();
        let a = graph.insert(EntityKind::Individual(Individual::from_record(&record("I1", "", ""))));
        let b = graph.insert(EntityKind::Individual(Individual::from_record(&record("I2", "", ""))));

        assert_eq!(graph.associate(a, a), Err(GraphError::SelfLink(a)));
        assert!(matches!(graph.associate(a, b), Err(GraphError::SameVariant { .. })));
        assert!(matches!(
            graph.associate(a, EntityId(99)),
            Err(GraphError::UnknownEntity(_))
        ));
        assert_eq!(graph.link_count(), 0);
    }

    #[test]
    fn bucket_key_normalizes_the_name_only() {
        let a = Facility::from_record(&record("I1", "Main Clinic", "A1"));
        let b = Facility::from_record(&record("I2", " MAIN CLINIC ", "A2"));
        let c = Facility::from_record(&record("I3", "Other Clinic", "A1"));
        assert_eq!(a.bucket_key(), b.bucket_key());
        assert_ne!(a.bucket_key(), c.bucket_key());
    }

    #[test]
    fn blank_fields_read_as_absent() {
        let kind = EntityKind::Facility(Facility::from_record(&record("I1", "Clinic", "")));
        assert!(!kind.has_attribute(Attribute::AddressId));
        assert!(kind.has_attribute(Attribute::AddressLine1));
        assert_eq!(kind.value(Attribute::LastName), None);
    }
}
