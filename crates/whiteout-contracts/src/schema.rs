use serde_json::{json, Value};

use crate::errors::StudioError;
use crate::estimate::{BoundingBox, CostEstimate, CostOption, PricedItem};

pub const ESTIMATE_SCHEMA_VERSION: u64 = 1;

/// Declarative response shape submitted with every cost-estimation call so
/// the backend constrains its own output. The runtime decoder below
/// re-checks the same contract; the backend is never trusted to have
/// honored it.
pub fn estimate_response_schema() -> Value {
    json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": {
                "item": {
                    "type": "STRING",
                    "description": "The general category of the item (e.g., \"Kitchen Benchtop\", \"Sofa\").",
                },
                "boundingBox": {
                    "type": "ARRAY",
                    "description": "A normalized bounding box for the item's location in the image, in the format [yMin, xMin, yMax, xMax].",
                    "items": { "type": "NUMBER" },
                },
                "options": {
                    "type": "ARRAY",
                    "description": "An array containing exactly two options for the item: one budget, one premium.",
                    "items": {
                        "type": "OBJECT",
                        "properties": {
                            "optionName": {
                                "type": "STRING",
                                "description": "The specific name for this option (e.g., \"Mid-Range Fabric Sofa\").",
                            },
                            "description": {
                                "type": "STRING",
                                "description": "A brief description of this option.",
                            },
                            "estimatedCostAUD": {
                                "type": "NUMBER",
                                "description": "The estimated cost of this option in Australian Dollars (AUD).",
                            },
                            "suggestedSupplier": {
                                "type": "STRING",
                                "description": "A plausible Australian supplier for this type of item.",
                            },
                        },
                        "required": ["optionName", "description", "estimatedCostAUD", "suggestedSupplier"],
                    },
                },
            },
            "required": ["item", "boundingBox", "options"],
        },
    })
}

/// Structural validation of a cost-estimate payload. Every violation is a
/// [`StudioError::SchemaValidation`]; a missing option is never defaulted
/// to a zero-cost placeholder.
pub fn decode_estimate(payload: &Value) -> Result<CostEstimate, StudioError> {
    let rows = payload.as_array().ok_or_else(|| {
        StudioError::SchemaValidation("AI response was not a JSON array of items.".to_string())
    })?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(decode_item(row)?);
    }
    Ok(CostEstimate::new(items))
}

fn decode_item(row: &Value) -> Result<PricedItem, StudioError> {
    let label = row
        .get("item")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            StudioError::SchemaValidation(
                "AI response did not provide a label for every item.".to_string(),
            )
        })?;

    let bounding_box = row
        .get("boundingBox")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<f64>>>()
                .unwrap_or_default()
        })
        .and_then(|coords| BoundingBox::from_wire(&coords))
        .ok_or_else(|| {
            StudioError::SchemaValidation(format!(
                "AI response did not provide a valid bounding box for \"{label}\"."
            ))
        })?;

    let options = row
        .get("options")
        .and_then(Value::as_array)
        .filter(|rows| rows.len() == 2)
        .ok_or_else(|| {
            StudioError::SchemaValidation(format!(
                "AI response did not provide two options for comparison for \"{label}\"."
            ))
        })?;

    let budget = decode_option(&options[0], label)?;
    let premium = decode_option(&options[1], label)?;

    Ok(PricedItem {
        label: label.to_string(),
        bounding_box,
        options: [budget, premium],
    })
}

fn decode_option(row: &Value, label: &str) -> Result<CostOption, StudioError> {
    let field = |key: &str| {
        row.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                StudioError::SchemaValidation(format!(
                    "Option for \"{label}\" is missing \"{key}\"."
                ))
            })
    };

    let name = field("optionName")?;
    let description = field("description")?;
    let supplier = field("suggestedSupplier")?;
    let estimated_cost = row
        .get("estimatedCostAUD")
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite() && *value >= 0.0)
        .ok_or_else(|| {
            StudioError::SchemaValidation(format!(
                "Option \"{name}\" for \"{label}\" is missing a usable estimatedCostAUD."
            ))
        })?;

    Ok(CostOption {
        name,
        description,
        estimated_cost,
        supplier,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_estimate, estimate_response_schema};
    use crate::errors::StudioError;

    fn wire_option(name: &str, cost: f64) -> serde_json::Value {
        json!({
            "optionName": name,
            "description": format!("{name} in oak veneer"),
            "estimatedCostAUD": cost,
            "suggestedSupplier": "Temple & Webster",
        })
    }

    #[test]
    fn schema_declares_the_required_item_shape() {
        let schema = estimate_response_schema();
        assert_eq!(schema["type"], json!("ARRAY"));
        assert_eq!(
            schema["items"]["required"],
            json!(["item", "boundingBox", "options"])
        );
        assert_eq!(
            schema["items"]["properties"]["options"]["items"]["required"],
            json!(["optionName", "description", "estimatedCostAUD", "suggestedSupplier"])
        );
    }

    #[test]
    fn well_formed_payload_decodes() {
        let payload = json!([{
            "item": "Kitchen Benchtop",
            "boundingBox": [0.2, 0.1, 0.5, 0.4],
            "options": [wire_option("Laminate Benchtop", 1200.0), wire_option("Caesarstone Benchtop", 4800.0)],
        }]);
        let estimate = decode_estimate(&payload).unwrap();
        assert_eq!(estimate.len(), 1);
        assert_eq!(estimate.items[0].label, "Kitchen Benchtop");
        assert_eq!(estimate.items[0].budget().estimated_cost, 1200.0);
        assert_eq!(estimate.items[0].premium().name, "Caesarstone Benchtop");
        assert_eq!(estimate.items[0].bounding_box.y_max, 0.5);
    }

    #[test]
    fn single_option_item_is_a_schema_violation() {
        let payload = json!([{
            "item": "Sofa",
            "boundingBox": [0.2, 0.1, 0.5, 0.4],
            "options": [wire_option("Fabric Sofa", 900.0)],
        }]);
        let err = decode_estimate(&payload).unwrap_err();
        assert!(matches!(err, StudioError::SchemaValidation(_)));
        assert!(err.to_string().contains("two options"));
    }

    #[test]
    fn short_bounding_box_is_a_schema_violation() {
        let payload = json!([{
            "item": "Sofa",
            "boundingBox": [0.2, 0.1, 0.5],
            "options": [wire_option("Fabric Sofa", 900.0), wire_option("Leather Sofa", 3200.0)],
        }]);
        assert!(matches!(
            decode_estimate(&payload).unwrap_err(),
            StudioError::SchemaValidation(_)
        ));
    }

    #[test]
    fn missing_cost_is_never_defaulted() {
        let payload = json!([{
            "item": "Sofa",
            "boundingBox": [0.2, 0.1, 0.5, 0.4],
            "options": [
                wire_option("Fabric Sofa", 900.0),
                {
                    "optionName": "Leather Sofa",
                    "description": "Full-grain leather three seater",
                    "suggestedSupplier": "King Living",
                },
            ],
        }]);
        let err = decode_estimate(&payload).unwrap_err();
        assert!(matches!(err, StudioError::SchemaValidation(_)));
        assert!(err.to_string().contains("estimatedCostAUD"));
    }

    #[test]
    fn non_array_payload_is_rejected() {
        assert!(matches!(
            decode_estimate(&json!({"items": []})).unwrap_err(),
            StudioError::SchemaValidation(_)
        ));
    }
}
