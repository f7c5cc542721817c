use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Dependent, Entity, OnDelete, Reference};
use crate::table::{IndexValue, Table};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    Available,
    Assigned,
    InTransit,
    Maintenance,
    Retired,
    Lost,
    Damaged,
}

impl PropertyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PropertyStatus::Available => "available",
            PropertyStatus::Assigned => "assigned",
            PropertyStatus::InTransit => "in_transit",
            PropertyStatus::Maintenance => "maintenance",
            PropertyStatus::Retired => "retired",
            PropertyStatus::Lost => "lost",
            PropertyStatus::Damaged => "damaged",
        }
    }
}

/// Sub-item issued together with a property (e.g. a mount or cleaning kit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsn: Option<String>,
    pub quantity: i64,
}

/// A hand-receipt line: one serialised piece of equipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub id: String,
    pub name: String,
    pub serial_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsn: Option<String>,
    pub category: String,
    pub status: PropertyStatus,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<Component>>,
}

impl Entity for Property {
    const TABLE: Table = Table::Properties;
    const DEPENDENTS: &'static [Dependent] = &[Dependent {
        table: Table::MaintenanceItems,
        index: "by-itemId",
        on_delete: OnDelete::Restrict,
    }];

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, column: &str) -> IndexValue {
        match column {
            "name" => (&self.name).into(),
            "serial_number" => (&self.serial_number).into(),
            "category" => (&self.category).into(),
            "status" => self.status.as_str().into(),
            "location" => (&self.location).into(),
            _ => IndexValue::Null,
        }
    }

    fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() || self.serial_number.trim().is_empty() {
            return Err(AppError::validation("Property needs a name and serial number.")
                .with_context("id", self.id.clone()));
        }
        if let Some(components) = &self.components {
            if components.iter().any(|c| c.quantity < 0) {
                return Err(AppError::validation("Component quantities cannot be negative.")
                    .with_context("id", self.id.clone()));
            }
        }
        Ok(())
    }
}

/// A stocked supply line tracked by quantity rather than serial number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumable {
    pub id: String,
    pub name: String,
    pub nsn: String,
    pub category: String,
    pub unit: String,
    pub current_quantity: i64,
    pub minimum_quantity: i64,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Consumable {
    pub fn is_low_stock(&self) -> bool {
        self.current_quantity <= self.minimum_quantity
    }
}

impl Entity for Consumable {
    const TABLE: Table = Table::Consumables;
    const DEPENDENTS: &'static [Dependent] = &[Dependent {
        table: Table::ConsumptionHistory,
        index: "by-itemId",
        on_delete: OnDelete::Cascade,
    }];
    const AFFECTS_STATS: bool = true;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, column: &str) -> IndexValue {
        match column {
            "name" => (&self.name).into(),
            "nsn" => (&self.nsn).into(),
            "category" => (&self.category).into(),
            "current_quantity" => self.current_quantity.into(),
            "expiration_date" => self.expiration_date.into(),
            _ => IndexValue::Null,
        }
    }

    fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::validation("Consumable needs a name.")
                .with_context("id", self.id.clone()));
        }
        if self.current_quantity < 0 || self.minimum_quantity < 0 {
            return Err(AppError::validation("Quantities cannot be negative.")
                .with_context("id", self.id.clone())
                .with_context("current_quantity", self.current_quantity.to_string())
                .with_context("minimum_quantity", self.minimum_quantity.to_string()));
        }
        Ok(())
    }
}

/// One issue of a consumable, owned by that consumable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionHistoryEntry {
    pub id: String,
    pub item_id: String,
    pub quantity: i64,
    pub date: DateTime<Utc>,
    pub issued_to: String,
    pub issued_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Entity for ConsumptionHistoryEntry {
    const TABLE: Table = Table::ConsumptionHistory;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, column: &str) -> IndexValue {
        match column {
            "item_id" => (&self.item_id).into(),
            "date" => self.date.into(),
            _ => IndexValue::Null,
        }
    }

    fn references(&self) -> Vec<Reference> {
        vec![Reference {
            table: Table::Consumables,
            id: self.item_id.clone(),
            field: "itemId",
        }]
    }

    fn validate(&self) -> AppResult<()> {
        if self.quantity <= 0 {
            return Err(AppError::validation("Issued quantity must be positive.")
                .with_context("id", self.id.clone())
                .with_context("quantity", self.quantity.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

impl Entity for Notification {
    const TABLE: Table = Table::Notifications;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, column: &str) -> IndexValue {
        match column {
            "type" => (&self.kind).into(),
            "timestamp" => self.timestamp.into(),
            "read" => self.read.into(),
            _ => IndexValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn property_json_uses_camel_case_and_omits_absent_components() {
        let property = Property {
            id: "p1".into(),
            name: "Rifle, 5.56mm M4".into(),
            serial_number: "W123456".into(),
            nsn: None,
            category: "weapons".into(),
            status: PropertyStatus::InTransit,
            location: "Arms room".into(),
            assigned_to: None,
            components: None,
        };
        let value = serde_json::to_value(&property).expect("serialize");
        assert_eq!(value["serialNumber"], json!("W123456"));
        assert_eq!(value["status"], json!("in_transit"));
        assert!(value.get("components").is_none());
    }

    #[test]
    fn low_stock_includes_the_minimum() {
        let mut c = Consumable {
            id: "c1".into(),
            name: "Battery, BA-5590".into(),
            nsn: "6135-01-036-3495".into(),
            category: "batteries".into(),
            unit: "EA".into(),
            current_quantity: 10,
            minimum_quantity: 10,
            location: "Supply cage".into(),
            expiration_date: None,
            notes: None,
        };
        assert!(c.is_low_stock());
        c.current_quantity = 11;
        assert!(!c.is_low_stock());
    }

    #[test]
    fn negative_quantity_fails_validation() {
        let entry = ConsumptionHistoryEntry {
            id: "h1".into(),
            item_id: "c1".into(),
            quantity: 0,
            date: Utc::now(),
            issued_to: "1st PLT".into(),
            issued_by: "SPC Doe".into(),
            notes: None,
        };
        assert!(entry.validate().is_err());
    }
}
