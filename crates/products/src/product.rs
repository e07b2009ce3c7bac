use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use catalog_core::{DomainError, ProductId};
use catalog_events::{Action, CommandEnvelope, Payload, Projection};

/// Full field set for a new product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: f64,
    #[serde(default)]
    pub category: Option<String>,
}

impl ProductDraft {
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        Self {
            name: name.into(),
            description: None,
            price,
            category: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("product name must not be empty"));
        }
        validate_price(self.price)
    }

    pub fn into_payload(self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("name".to_string(), JsonValue::from(self.name));
        payload.insert("description".to_string(), JsonValue::from(self.description));
        payload.insert("price".to_string(), JsonValue::from(self.price));
        payload.insert("category".to_string(), JsonValue::from(self.category));
        payload
    }
}

/// Partial field set for an update; only `Some` fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
}

impl ProductPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.price.is_none()
            && self.category.is_none()
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.is_empty() {
            return Err(DomainError::validation("update must set at least one field"));
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(DomainError::validation("product name must not be empty"));
            }
        }
        match self.price {
            Some(price) => validate_price(price),
            None => Ok(()),
        }
    }

    pub fn into_payload(self) -> Payload {
        let mut payload = Payload::new();
        if let Some(name) = self.name {
            payload.insert("name".to_string(), JsonValue::from(name));
        }
        if let Some(description) = self.description {
            payload.insert("description".to_string(), JsonValue::from(description));
        }
        if let Some(price) = self.price {
            payload.insert("price".to_string(), JsonValue::from(price));
        }
        if let Some(category) = self.category {
            payload.insert("category".to_string(), JsonValue::from(category));
        }
        payload
    }
}

fn validate_price(price: f64) -> Result<(), DomainError> {
    if !price.is_finite() || price < 0.0 {
        return Err(DomainError::validation(format!(
            "price must be a non-negative number, got {price}"
        )));
    }
    Ok(())
}

/// A write-side intent, validated before it becomes an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ProductCommand {
    Create(ProductDraft),
    Update { product_id: ProductId, patch: ProductPatch },
    Delete { product_id: ProductId },
}

impl ProductCommand {
    pub fn action(&self) -> Action {
        match self {
            ProductCommand::Create(_) => Action::Create,
            ProductCommand::Update { .. } => Action::Update,
            ProductCommand::Delete { .. } => Action::Delete,
        }
    }

    /// Build the envelope stamped with the current time.
    pub fn into_envelope(self) -> Result<CommandEnvelope, DomainError> {
        self.into_envelope_at(Utc::now())
    }

    /// Build the envelope. `create` gets a freshly generated id.
    pub fn into_envelope_at(self, now: DateTime<Utc>) -> Result<CommandEnvelope, DomainError> {
        let envelope = match self {
            ProductCommand::Create(draft) => {
                draft.validate()?;
                CommandEnvelope::create(ProductId::generate(), draft.into_payload())
            }
            ProductCommand::Update { product_id, patch } => {
                patch.validate()?;
                CommandEnvelope::update(product_id, patch.into_payload())
            }
            ProductCommand::Delete { product_id } => CommandEnvelope::delete(product_id),
        };
        Ok(envelope.with_timestamp(now))
    }
}

/// Projected product document (read model).
///
/// Attributes mirror the payload fields; unknown fields are kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    product_id: ProductId,
    #[serde(flatten)]
    fields: Payload,
}

impl ProductRecord {
    pub fn new(product_id: ProductId, fields: Payload) -> Self {
        let mut fields = fields;
        fields.remove("product_id");
        Self { product_id, fields }
    }

    pub fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    pub fn fields(&self) -> &Payload {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name)
    }

    pub fn name(&self) -> Option<&str> {
        self.field("name").and_then(JsonValue::as_str)
    }

    pub fn description(&self) -> Option<&str> {
        self.field("description").and_then(JsonValue::as_str)
    }

    pub fn price(&self) -> Option<f64> {
        self.field("price").and_then(JsonValue::as_f64)
    }

    pub fn category(&self) -> Option<&str> {
        self.field("category").and_then(JsonValue::as_str)
    }

    /// Partial merge: listed fields are overwritten, others untouched.
    pub fn merge(&mut self, fields: &Payload) {
        for (key, value) in fields {
            if key != "product_id" {
                self.fields.insert(key.clone(), value.clone());
            }
        }
    }

    /// The record as a flat JSON document (`product_id` + fields).
    pub fn to_document(&self) -> JsonValue {
        let mut doc = self.fields.clone();
        doc.insert(
            "product_id".to_string(),
            JsonValue::String(self.product_id.to_string()),
        );
        JsonValue::Object(doc)
    }
}

/// Pure in-memory catalog: the reference fold of create/update/delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductCatalog {
    records: BTreeMap<ProductId, ProductRecord>,
}

impl ProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, product_id: &ProductId) -> Option<&ProductRecord> {
        self.records.get(product_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &ProductRecord> {
        self.records.values()
    }
}

impl Projection for ProductCatalog {
    fn apply(&mut self, envelope: &CommandEnvelope) -> u64 {
        let product_id = envelope.product_id();
        match envelope.action() {
            Action::Create => {
                self.records.insert(
                    product_id.clone(),
                    ProductRecord::new(product_id.clone(), envelope.payload().clone()),
                );
                1
            }
            Action::Update => match self.records.get_mut(product_id) {
                Some(record) => {
                    record.merge(envelope.payload());
                    1
                }
                None => 0,
            },
            Action::Delete => u64::from(self.records.remove(product_id).is_some()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pid(s: &str) -> ProductId {
        ProductId::new(s).unwrap()
    }

    fn payload(value: JsonValue) -> Payload {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn create_command_generates_id_and_stamps_time() {
        let now = Utc::now();
        let env = ProductCommand::Create(
            ProductDraft::new("Laptop", 999.99).with_category("Electronics"),
        )
        .into_envelope_at(now)
        .unwrap();

        assert_eq!(env.action(), Action::Create);
        assert!(env.product_id().as_str().starts_with("prod_"));
        assert_eq!(env.timestamp(), Some(now));
        assert_eq!(env.payload().get("name"), Some(&json!("Laptop")));
        assert_eq!(env.payload().get("description"), Some(&JsonValue::Null));
    }

    #[test]
    fn invalid_intents_are_rejected() {
        let empty_name = ProductCommand::Create(ProductDraft::new("  ", 1.0)).into_envelope();
        assert!(matches!(empty_name, Err(DomainError::Validation(_))));

        let negative = ProductCommand::Create(ProductDraft::new("Pen", -1.0)).into_envelope();
        assert!(matches!(negative, Err(DomainError::Validation(_))));

        let nan = ProductCommand::Update {
            product_id: pid("prod_1"),
            patch: ProductPatch { price: Some(f64::NAN), ..Default::default() },
        }
        .into_envelope();
        assert!(matches!(nan, Err(DomainError::Validation(_))));

        let empty_patch = ProductCommand::Update {
            product_id: pid("prod_1"),
            patch: ProductPatch::default(),
        }
        .into_envelope();
        assert!(matches!(empty_patch, Err(DomainError::Validation(_))));
    }

    #[test]
    fn patch_only_sends_set_fields() {
        let env = ProductCommand::Update {
            product_id: pid("prod_1"),
            patch: ProductPatch { price: Some(899.99), ..Default::default() },
        }
        .into_envelope()
        .unwrap();

        assert_eq!(env.payload(), &payload(json!({ "price": 899.99 })));
    }

    #[test]
    fn catalog_follows_laptop_lifecycle() {
        let mut catalog = ProductCatalog::new();
        let id = pid("prod_1");

        let created = catalog.apply(&CommandEnvelope::create(
            id.clone(),
            payload(json!({ "name": "Laptop", "price": 999.99 })),
        ));
        assert_eq!(created, 1);

        let updated = catalog.apply(&CommandEnvelope::update(
            id.clone(),
            payload(json!({ "price": 899.99 })),
        ));
        assert_eq!(updated, 1);

        let record = catalog.get(&id).unwrap();
        assert_eq!(record.name(), Some("Laptop"));
        assert_eq!(record.price(), Some(899.99));

        assert_eq!(catalog.apply(&CommandEnvelope::delete(id.clone())), 1);
        assert!(catalog.get(&id).is_none());

        let late_update = catalog.apply(&CommandEnvelope::update(
            id.clone(),
            payload(json!({ "price": 1.0 })),
        ));
        assert_eq!(late_update, 0);
        assert_eq!(catalog.apply(&CommandEnvelope::delete(id.clone())), 0);
        assert!(catalog.is_empty());
    }

    #[test]
    fn create_overwrites_existing_record() {
        let mut catalog = ProductCatalog::new();
        let id = pid("prod_1");

        catalog.apply(&CommandEnvelope::create(
            id.clone(),
            payload(json!({ "name": "Laptop", "category": "Electronics" })),
        ));
        catalog.apply(&CommandEnvelope::create(
            id.clone(),
            payload(json!({ "name": "Tablet" })),
        ));

        let record = catalog.get(&id).unwrap();
        assert_eq!(record.name(), Some("Tablet"));
        assert_eq!(record.category(), None);
    }

    #[test]
    fn record_document_round_trips_through_serde() {
        let record = ProductRecord::new(
            pid("prod_1"),
            payload(json!({ "name": "Laptop", "price": 999.99 })),
        );

        let doc = record.to_document();
        assert_eq!(doc["product_id"], json!("prod_1"));

        let back: ProductRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(back, record);
    }

    #[cfg(test)]
    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_fields() -> impl Strategy<Value = Payload> {
            prop::collection::btree_map(
                prop::sample::select(vec!["name", "description", "price", "category"]),
                prop_oneof![
                    "[A-Za-z ]{0,12}".prop_map(JsonValue::from),
                    (0u32..100_000).prop_map(|cents| JsonValue::from(f64::from(cents) / 100.0)),
                    Just(JsonValue::Null),
                ],
                0..4,
            )
            .prop_map(|m| m.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
        }

        fn arb_envelope(id: ProductId) -> impl Strategy<Value = CommandEnvelope> {
            prop_oneof![
                arb_fields().prop_map({
                    let id = id.clone();
                    move |f| CommandEnvelope::create(id.clone(), f)
                }),
                arb_fields().prop_map({
                    let id = id.clone();
                    move |f| CommandEnvelope::update(id.clone(), f)
                }),
                Just(CommandEnvelope::delete(id)),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Property: consecutive duplicate deliveries don't change the fold.
            #[test]
            fn replaying_duplicates_is_idempotent(
                envelopes in prop::collection::vec(arb_envelope(ProductId::new("prod_1").unwrap()), 0..20),
                repeats in prop::collection::vec(1usize..4, 20)
            ) {
                let mut once = ProductCatalog::new();
                once.apply_all(&envelopes);

                let mut replayed = ProductCatalog::new();
                for (envelope, times) in envelopes.iter().zip(repeats.iter().cycle()) {
                    for _ in 0..*times {
                        replayed.apply(envelope);
                    }
                }

                prop_assert_eq!(once, replayed);
            }

            /// Property: update never touches fields it doesn't name.
            #[test]
            fn update_is_a_partial_merge(base in arb_fields(), patch in arb_fields()) {
                let id = ProductId::new("prod_1").unwrap();
                let mut catalog = ProductCatalog::new();
                catalog.apply(&CommandEnvelope::create(id.clone(), base.clone()));
                catalog.apply(&CommandEnvelope::update(id.clone(), patch.clone()));

                let record = catalog.get(&id).unwrap();
                for (key, value) in &base {
                    if !patch.contains_key(key) {
                        prop_assert_eq!(record.field(key), Some(value));
                    }
                }
                for (key, value) in &patch {
                    prop_assert_eq!(record.field(key), Some(value));
                }
            }
        }
    }
}
