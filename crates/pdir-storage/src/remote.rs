//! OData-style Web API store.
//!
//! Records are fetched with `$filter` queries and followed through
//! `@odata.nextLink` paging. Writes go through the `CreateMultiple` and
//! `UpdateMultiple` actions; links through `$ref` on the relationship
//! navigation property.

use std::collections::BTreeMap;

use async_trait::async_trait;
use pdir_core::{Attribute, AttributeKind, AttributeValue, Predicate, StoreEntity, StoreId, StoreRef, Variant};
use reqwest::Method;
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use crate::http::HttpFetcher;
use crate::{check_batch, check_conditions, StoreError, TargetStore};

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// e.g. `https://org.example.com/api/data/v9.2`
    pub base_url: String,
    pub max_batch: usize,
    pub max_conditions: usize,
}

#[derive(Debug)]
pub struct HttpStore {
    http: HttpFetcher,
    config: HttpStoreConfig,
}

fn logical_name(variant: Variant) -> &'static str {
    match variant {
        Variant::Individual => "pd_individual",
        Variant::Facility => "pd_facility",
        Variant::Group => "pd_group",
    }
}

/// Many-to-many relationship name, independent of direction.
pub fn relationship_name(a: Variant, b: Variant) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{}_{}", logical_name(first), logical_name(second).trim_start_matches("pd_"))
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn encode_value(value: &AttributeValue) -> JsonValue {
    match value {
        AttributeValue::Text(s) => JsonValue::String(s.clone()),
        AttributeValue::Integer(i) => JsonValue::from(*i),
        AttributeValue::Flag(b) => JsonValue::Bool(*b),
    }
}

pub fn decode_value(kind: AttributeKind, raw: &JsonValue) -> Option<AttributeValue> {
    match (kind, raw) {
        (_, JsonValue::Null) => None,
        (AttributeKind::Text, JsonValue::String(s)) => Some(AttributeValue::Text(s.clone())),
        (AttributeKind::Text, other) => Some(AttributeValue::Text(other.to_string())),
        (AttributeKind::Integer | AttributeKind::OptionSet, JsonValue::Number(n)) => n.as_i64().map(AttributeValue::Integer),
        (AttributeKind::Integer | AttributeKind::OptionSet, JsonValue::String(s)) => {
            s.trim().parse().ok().map(AttributeValue::Integer)
        }
        (AttributeKind::Flag, JsonValue::Bool(b)) => Some(AttributeValue::Flag(*b)),
        _ => None,
    }
}

pub fn encode_entity(entity: &StoreEntity) -> JsonValue {
    let mut body = Map::new();
    body.insert(
        "@odata.type".into(),
        JsonValue::String(format!("Microsoft.Dynamics.CRM.{}", logical_name(entity.variant))),
    );
    if let Some(id) = &entity.id {
        body.insert(entity.variant.id_field().into(), JsonValue::String(id.to_string()));
    }
    for attribute in Attribute::for_variant(entity.variant) {
        let value = entity.get(attribute).map(encode_value).unwrap_or(JsonValue::Null);
        body.insert(attribute.field().into(), value);
    }
    JsonValue::Object(body)
}

pub fn decode_entity(variant: Variant, raw: &JsonValue) -> Result<StoreEntity, StoreError> {
    let object = raw
        .as_object()
        .ok_or_else(|| StoreError::Decode(format!("expected a {variant} object, got {raw}")))?;
    let id = object
        .get(variant.id_field())
        .and_then(JsonValue::as_str)
        .ok_or_else(|| StoreError::Decode(format!("{variant} record without {}", variant.id_field())))?;
    let mut entity = StoreEntity::with_id(variant, StoreId::new(id));
    for attribute in Attribute::for_variant(variant) {
        if let Some(raw) = object.get(attribute.field()) {
            entity.set(attribute, decode_value(attribute.kind(), raw));
        }
    }
    Ok(entity)
}

impl HttpStore {
    pub fn new(http: HttpFetcher, config: HttpStoreConfig) -> Self {
        Self { http, config }
    }

    fn set_url(&self, variant: Variant) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), variant.entity_set())
    }

    fn record_url(&self, store_ref: &StoreRef) -> String {
        format!("{}({})", self.set_url(store_ref.variant), store_ref.id)
    }

    fn select_clause(variant: Variant) -> String {
        std::iter::once(variant.id_field())
            .chain(Attribute::for_variant(variant).map(Attribute::field))
            .collect::<Vec<_>>()
            .join(",")
    }

    async fn fetch_raw_filter(&self, variant: Variant, filter: Option<String>) -> Result<Vec<StoreEntity>, StoreError> {
        let mut query = vec![("$select", Self::select_clause(variant))];
        if let Some(filter) = filter {
            query.push(("$filter", filter));
        }
        let mut url = self.set_url(variant);
        let mut out = Vec::new();
        let mut first = true;
        loop {
            let response = if first {
                self.http.get_json(&url, &query).await?
            } else {
                self.http.get_json(&url, &[]).await?
            };
            first = false;
            let body = response
                .body
                .ok_or_else(|| StoreError::Decode(format!("empty response from {url}")))?;
            let rows = body
                .get("value")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| StoreError::Decode(format!("response from {url} has no value array")))?;
            for row in rows {
                out.push(decode_entity(variant, row)?);
            }
            match body.get("@odata.nextLink").and_then(JsonValue::as_str) {
                Some(next) => {
                    debug!(%variant, fetched = out.len(), "following next link");
                    url = next.to_string();
                }
                None => break,
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl TargetStore for HttpStore {
    fn max_batch_size(&self) -> usize {
        self.config.max_batch.max(1)
    }

    fn max_conditions(&self) -> usize {
        self.config.max_conditions.max(1)
    }

    async fn fetch(
        &self,
        variant: Variant,
        filter: Option<&Predicate>,
    ) -> Result<Vec<StoreEntity>, StoreError> {
        check_conditions(filter, self.max_conditions())?;
        self.fetch_raw_filter(variant, filter.map(Predicate::to_filter)).await
    }

    async fn fetch_by_ids(
        &self,
        variant: Variant,
        ids: &[StoreId],
    ) -> Result<Vec<StoreEntity>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.max_conditions()) {
            let filter = chunk
                .iter()
                .map(|id| format!("{} eq {}", variant.id_field(), quote(id.as_str())))
                .collect::<Vec<_>>()
                .join(" or ");
            out.extend(self.fetch_raw_filter(variant, Some(filter)).await?);
        }
        Ok(out)
    }

    async fn create_many(
        &self,
        variant: Variant,
        entities: &[StoreEntity],
    ) -> Result<Vec<StoreId>, StoreError> {
        check_batch(entities.len(), self.max_batch_size())?;
        let targets: Vec<JsonValue> = entities.iter().map(encode_entity).collect();
        let url = format!("{}/CreateMultiple", self.set_url(variant));
        let response = self
            .http
            .send_json(Method::POST, &url, &json!({ "Targets": targets }))
            .await?;
        let ids: Vec<StoreId> = response
            .body
            .as_ref()
            .and_then(|b| b.get("Ids"))
            .and_then(JsonValue::as_array)
            .ok_or_else(|| StoreError::Decode("CreateMultiple response has no Ids".into()))?
            .iter()
            .filter_map(JsonValue::as_str)
            .map(StoreId::new)
            .collect();
        if ids.len() != entities.len() {
            return Err(StoreError::IdCountMismatch {
                sent: entities.len(),
                returned: ids.len(),
            });
        }
        Ok(ids)
    }

    async fn update_many(&self, variant: Variant, entities: &[StoreEntity]) -> Result<(), StoreError> {
        check_batch(entities.len(), self.max_batch_size())?;
        let mut targets = Vec::with_capacity(entities.len());
        for entity in entities {
            if entity.id.is_none() {
                return Err(StoreError::MissingId(variant));
            }
            targets.push(encode_entity(entity));
        }
        let url = format!("{}/UpdateMultiple", self.set_url(variant));
        self.http
            .send_json(Method::POST, &url, &json!({ "Targets": targets }))
            .await?;
        Ok(())
    }

    async fn associate(
        &self,
        source: &StoreRef,
        targets: &BTreeMap<Variant, Vec<StoreId>>,
    ) -> Result<(), StoreError> {
        for (variant, ids) in targets {
            let url = format!(
                "{}/{}/$ref",
                self.record_url(source),
                relationship_name(source.variant, *variant)
            );
            for id in ids {
                let target = StoreRef {
                    variant: *variant,
                    id: id.clone(),
                };
                self.http
                    .send_json(Method::POST, &url, &json!({ "@odata.id": self.record_url(&target) }))
                    .await?;
            }
        }
        Ok(())
    }

    async fn relation_exists(&self, a: &StoreRef, b: &StoreRef) -> Result<bool, StoreError> {
        let url = format!("{}/{}", self.record_url(a), relationship_name(a.variant, b.variant));
        let query = [
            ("$select", b.variant.id_field().to_string()),
            ("$filter", format!("{} eq {}", b.variant.id_field(), quote(b.id.as_str()))),
        ];
        let response = self.http.get_json(&url, &query).await?;
        Ok(response
            .body
            .as_ref()
            .and_then(|b| b.get("value"))
            .and_then(JsonValue::as_array)
            .is_some_and(|rows| !rows.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relationship_name_is_direction_independent() {
        assert_eq!(
            relationship_name(Variant::Group, Variant::Individual),
            relationship_name(Variant::Individual, Variant::Group)
        );
        assert_eq!(
            relationship_name(Variant::Facility, Variant::Individual),
            "pd_individual_facility"
        );
    }

    #[test]
    fn entity_json_round_trips_through_wire_shape() {
        let mut entity = StoreEntity::with_id(Variant::Facility, StoreId::new("f-1"));
        entity.set(Attribute::FacilityName, Some(AttributeValue::text("Clinic")));
        entity.set(Attribute::Line2Suppressed, Some(AttributeValue::Flag(true)));
        entity.set(Attribute::AffiliatedCount, Some(AttributeValue::Integer(3)));

        let wire = encode_entity(&entity);
        assert_eq!(wire["pd_name"], json!("Clinic"));
        assert_eq!(wire["pd_phone"], JsonValue::Null);
        assert_eq!(wire["pd_facilityid"], json!("f-1"));

        let decoded = decode_entity(Variant::Facility, &wire).unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn decoding_requires_the_identifier() {
        let err = decode_entity(Variant::Group, &json!({ "pd_name": "x" })).unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[test]
    fn option_set_codes_decode_from_numbers_or_strings() {
        assert_eq!(
            decode_value(AttributeKind::OptionSet, &json!(100000001)),
            Some(AttributeValue::Integer(100000001))
        );
        assert_eq!(
            decode_value(AttributeKind::OptionSet, &json!("7")),
            Some(AttributeValue::Integer(7))
        );
        assert_eq!(decode_value(AttributeKind::Flag, &json!("yes")), None);
    }
}
