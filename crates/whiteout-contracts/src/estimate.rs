use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::StudioError;

/// Option index for the standard tier.
pub const BUDGET_OPTION: usize = 0;
/// Option index for the premium tier.
pub const PREMIUM_OPTION: usize = 1;

/// Normalized item location, expressed as fractions of image height and
/// width so it is resolution-independent. Invariants: every coordinate in
/// `[0, 1]`, `y_min <= y_max`, `x_min <= x_max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub y_min: f64,
    pub x_min: f64,
    pub y_max: f64,
    pub x_max: f64,
}

impl BoundingBox {
    /// Builds a box from the wire order `[yMin, xMin, yMax, xMax]`,
    /// rejecting anything that violates the normalization invariants.
    pub fn from_wire(values: &[f64]) -> Option<Self> {
        if values.len() != 4 {
            return None;
        }
        let candidate = Self {
            y_min: values[0],
            x_min: values[1],
            y_max: values[2],
            x_max: values[3],
        };
        candidate.is_normalized().then_some(candidate)
    }

    pub fn is_normalized(&self) -> bool {
        let coords = [self.y_min, self.x_min, self.y_max, self.x_max];
        coords.iter().all(|value| value.is_finite() && (0.0..=1.0).contains(value))
            && self.y_min <= self.y_max
            && self.x_min <= self.x_max
    }
}

/// One priced tier for an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostOption {
    #[serde(rename = "optionName")]
    pub name: String,
    pub description: String,
    #[serde(rename = "estimatedCostAUD")]
    pub estimated_cost: f64,
    #[serde(rename = "suggestedSupplier")]
    pub supplier: String,
}

/// One identified furnishing/material/finish with its location and exactly
/// two comparative options. Index 0 is the standard tier, index 1 the
/// premium tier; the order is semantic and preserved from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedItem {
    #[serde(rename = "item")]
    pub label: String,
    #[serde(rename = "boundingBox")]
    pub bounding_box: BoundingBox,
    pub options: [CostOption; 2],
}

impl PricedItem {
    pub fn budget(&self) -> &CostOption {
        &self.options[BUDGET_OPTION]
    }

    pub fn premium(&self) -> &CostOption {
        &self.options[PREMIUM_OPTION]
    }
}

/// The itemized estimate for one analyzed image. Immutable after creation;
/// a new analysis produces a new estimate rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub items: Vec<PricedItem>,
}

impl CostEstimate {
    pub fn new(items: Vec<PricedItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of each item's currently selected option cost. Derived, never
    /// stored.
    pub fn total_cost(&self, selections: &SelectionState) -> f64 {
        self.items
            .iter()
            .enumerate()
            .map(|(index, item)| item.options[selections.option_for(index)].estimated_cost)
            .sum()
    }
}

/// The user's chosen tier per priced item. Lifetime matches the estimate it
/// was created for; installing a new estimate replaces the whole map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionState {
    choices: IndexMap<usize, usize>,
}

impl SelectionState {
    /// Every item starts on the standard tier.
    pub fn for_estimate(estimate: &CostEstimate) -> Self {
        Self {
            choices: (0..estimate.len()).map(|index| (index, BUDGET_OPTION)).collect(),
        }
    }

    pub fn option_for(&self, item_index: usize) -> usize {
        self.choices.get(&item_index).copied().unwrap_or(BUDGET_OPTION)
    }

    /// Records an explicit user selection. Rejects option indexes other
    /// than the two tiers and items outside the estimate.
    pub fn select(
        &mut self,
        estimate: &CostEstimate,
        item_index: usize,
        option_index: usize,
    ) -> Result<(), StudioError> {
        if item_index >= estimate.len() {
            return Err(StudioError::Validation(format!(
                "No estimate item at index {item_index}."
            )));
        }
        if option_index != BUDGET_OPTION && option_index != PREMIUM_OPTION {
            return Err(StudioError::Validation(format!(
                "Option index must be 0 (budget) or 1 (premium), got {option_index}."
            )));
        }
        self.choices.insert(item_index, option_index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BoundingBox, CostEstimate, CostOption, PricedItem, SelectionState};
    use crate::errors::StudioError;

    fn option(name: &str, cost: f64) -> CostOption {
        CostOption {
            name: name.to_string(),
            description: format!("{name} description"),
            estimated_cost: cost,
            supplier: "Bunnings Warehouse".to_string(),
        }
    }

    fn item(label: &str, budget: f64, premium: f64) -> PricedItem {
        PricedItem {
            label: label.to_string(),
            bounding_box: BoundingBox {
                y_min: 0.1,
                x_min: 0.1,
                y_max: 0.4,
                x_max: 0.5,
            },
            options: [option("Standard", budget), option("Premium", premium)],
        }
    }

    fn three_item_estimate() -> CostEstimate {
        CostEstimate::new(vec![
            item("Sofa", 100.0, 300.0),
            item("Flooring", 100.0, 300.0),
            item("Pendant Light", 100.0, 300.0),
        ])
    }

    #[test]
    fn fresh_selection_defaults_every_item_to_budget() {
        let estimate = three_item_estimate();
        let selections = SelectionState::for_estimate(&estimate);
        for index in 0..estimate.len() {
            assert_eq!(selections.option_for(index), 0);
        }
        assert_eq!(estimate.total_cost(&selections), 300.0);
    }

    #[test]
    fn selecting_premium_moves_the_total_by_the_option_delta() {
        let estimate = three_item_estimate();
        let mut selections = SelectionState::for_estimate(&estimate);
        selections.select(&estimate, 1, 1).unwrap();
        assert_eq!(estimate.total_cost(&selections), 500.0);
        assert_eq!(selections.option_for(0), 0);
        assert_eq!(selections.option_for(2), 0);
    }

    #[test]
    fn selection_is_reversible() {
        let estimate = three_item_estimate();
        let mut selections = SelectionState::for_estimate(&estimate);
        let original = estimate.total_cost(&selections);
        selections.select(&estimate, 2, 1).unwrap();
        selections.select(&estimate, 2, 0).unwrap();
        assert_eq!(selections.option_for(2), 0);
        assert_eq!(estimate.total_cost(&selections), original);
    }

    #[test]
    fn out_of_range_selections_are_rejected() {
        let estimate = three_item_estimate();
        let mut selections = SelectionState::for_estimate(&estimate);
        assert!(matches!(
            selections.select(&estimate, 9, 0),
            Err(StudioError::Validation(_))
        ));
        assert!(matches!(
            selections.select(&estimate, 0, 2),
            Err(StudioError::Validation(_))
        ));
        assert_eq!(estimate.total_cost(&selections), 300.0);
    }

    #[test]
    fn bounding_box_wire_order_and_invariants() {
        let parsed = BoundingBox::from_wire(&[0.2, 0.1, 0.5, 0.4]).unwrap();
        assert_eq!(parsed.y_min, 0.2);
        assert_eq!(parsed.x_min, 0.1);
        assert_eq!(parsed.y_max, 0.5);
        assert_eq!(parsed.x_max, 0.4);

        assert!(BoundingBox::from_wire(&[0.2, 0.1, 0.5]).is_none());
        assert!(BoundingBox::from_wire(&[0.5, 0.1, 0.2, 0.4]).is_none());
        assert!(BoundingBox::from_wire(&[-0.1, 0.1, 0.5, 0.4]).is_none());
        assert!(BoundingBox::from_wire(&[0.2, 0.1, 0.5, 1.4]).is_none());
    }
}
